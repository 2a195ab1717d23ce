//! tailon supervisor library
//!
//! Owns a fixed set of configured applications and lets callers start,
//! stop and restart them, while capturing each process's output into a
//! bounded per-application log buffer interleaved with audit lines that
//! attribute every transition to the caller that caused it.

pub mod app;
pub mod audit;
pub mod error;
pub mod identity;
pub mod logbuf;
pub mod manager;
pub mod role;
pub mod signal;

pub use app::{AppSnapshot, AppState, ApplicationConfig};
pub use error::{Result, SupervisorError};
pub use identity::Identity;
pub use logbuf::{LogLine, LogSource};
pub use manager::{Manager, ManagerOptions};
pub use role::{Grants, Role, RoleAssignment};
pub use signal::StopSignal;
