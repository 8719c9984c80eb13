//! Worker pool dispatcher.
//!
//! Supervises N worker processes, holds operations back until every worker
//! has come up once, and routes each operation to the connected worker with
//! the lowest polled concurrency.

pub mod balancer;
pub mod barrier;
pub mod config;
mod dispatcher;
mod error;
pub mod launcher;
mod supervisor;

pub use balancer::LoadTable;
pub use barrier::{PendingOps, StartupBarrier};
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, WorkerStats};
pub use error::{DispatchError, LaunchError};
pub use launcher::{LaunchedWorker, ProcessLauncher, WorkerLauncher};
