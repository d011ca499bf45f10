//! # TMS Common Library
//!
//! Shared code for the TMS reconciliation and payroll services including:
//! - Error and result types
//! - Configuration loading and database path resolution
//! - Database initialization, schema, migrations and settings
//! - Lock-contention retry for multi-process SQLite access
//! - Timestamp and id helpers
//! - `string_enum!` for enums stored as TEXT

#[macro_use]
mod macros;

pub mod config;
pub mod db;
pub mod error;
pub mod time;
pub mod uuid_utils;

pub use error::{Error, Result};
