//! Database initialization, migrations, settings and retry helpers

pub mod init;
pub mod migrations;
pub mod retry;
pub mod settings;

pub use init::*;
pub use migrations::*;
pub use retry::*;
pub use settings::*;
