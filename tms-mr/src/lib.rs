//! tms-mr library - Matching & Reconciliation
//!
//! Pairs supplier invoices with receipts, pit records and purchase orders,
//! classifies discrepancies and routes each one to a departmental ticket.

pub mod api;
pub mod classify;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod grouping;
pub mod models;
pub mod reconcile;
pub mod uom;

pub use crate::engine::MatchingEngine;
pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tms_common::config::MatchingToml;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub engine: Arc<MatchingEngine>,
    /// `[matching]` TOML section; pinned values win over the settings table
    pub matching_defaults: MatchingToml,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: MatchingEngine, matching_defaults: MatchingToml) -> Self {
        Self {
            db: engine.pool().clone(),
            engine: Arc::new(engine),
            matching_defaults,
            startup_time: Utc::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::matching_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
