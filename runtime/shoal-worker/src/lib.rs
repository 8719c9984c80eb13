//! Worker process: serves database methods on a call channel and reports
//! load to its parent over stdin/stdout.

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("shoal-worker needs the `sqlite` or `postgres` feature");

mod backend;
pub mod config;
pub mod methods;
mod observability;
mod parent;

pub use backend::{AnyDatabase, open_database};
pub use config::{DbBackend, WorkerConfig};
pub use methods::{WorkerMethod, register_methods};
pub use observability::init_tracing;
pub use parent::run_control;

use anyhow::{Context, Result};
use shoal_db::{Database, QueryExecutor};
use shoal_ipc::{ChannelServer, ListenOptions, MethodRegistry};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// Serves `db` until the parent closes the control channel or asks for
/// shutdown. `ready` is sent once the channel server is listening.
pub async fn run_worker<D, R, W>(config: &WorkerConfig, db: D, control_in: R, control_out: W) -> Result<()>
where
    D: Database,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let executor = QueryExecutor::new(db, config.max_concurrent_query);
    let mut registry = MethodRegistry::new();
    register_methods(&mut registry, executor.clone()).context("register worker methods")?;

    let server = ChannelServer::new(config.server_id.clone(), registry).with_codec(config.codec);
    let mut listen = ListenOptions::local(&config.socket_dir);
    if let (Some(addr), Some(secret)) = (config.net_bind, &config.shared_secret) {
        listen = listen.with_net(addr, secret.clone());
    }
    let running = server
        .listen(listen)
        .await
        .with_context(|| format!("listen in {}", config.socket_dir.display()))?;
    info!(
        server_id = %config.server_id,
        backend = config.backend.as_str(),
        max_concurrent_query = config.max_concurrent_query,
        "worker serving"
    );

    let outcome = run_control(
        executor,
        config.server_id.clone(),
        control_in,
        control_out,
        config.report_interval,
    )
    .await;
    running.shutdown();
    outcome.context("control channel failed")
}
