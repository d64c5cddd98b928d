pub mod config;
pub mod coordination;
pub mod error;
pub mod orchestrator;
pub mod snapshot;

pub use error::{BackupError, CleanupWarning};
pub use orchestrator::{BackupOrchestrator, BackupReport, BackupRun};
