//! tms-pw library - Payroll Worker
//!
//! Payroll concurrency control, incident-driven pausing and the checkpointed
//! batch worker. Worker processes coordinate only through the shared database.

pub mod config;
pub mod controller;
pub mod incidents;
pub mod jobs;
pub mod models;
pub mod probe;
pub mod tickets;
pub mod worker;

pub use crate::controller::PayrollController;
pub use crate::tickets::{DbTicketSource, TicketSource};
pub use crate::worker::{PayrollWorker, TickOutcome};
