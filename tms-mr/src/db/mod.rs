//! Database access for tms-mr
//!
//! Reads the four source tables and writes runs, matched records, exceptions,
//! exception queue entries and workflow tickets to the shared database.

pub mod results;
pub mod runs;
pub mod sources;

pub use results::*;
pub use runs::*;
pub use sources::*;
