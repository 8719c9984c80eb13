//! Starting worker processes.

use shoal_ipc::{Endpoint, SharedSecret};
use shoal_worker::WorkerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, info};

pub type ControlRead = Box<dyn AsyncRead + Send + Unpin>;
pub type ControlWrite = Box<dyn AsyncWrite + Send + Unpin>;
/// Resolves once the worker is gone. Dropping it stops the worker.
pub type ExitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker {index} has no {pipe} pipe")]
    MissingPipe { index: usize, pipe: &'static str },
    #[error("worker {index}: {message}")]
    Other { index: usize, message: String },
}

/// A started worker as the supervisor sees it.
pub struct LaunchedWorker {
    pub endpoint: Endpoint,
    /// Network listener to use when the local socket is unavailable.
    pub fallback: Option<(SocketAddr, SharedSecret)>,
    /// Messages from the worker.
    pub control_in: ControlRead,
    /// Messages to the worker.
    pub control_out: ControlWrite,
    pub exited: ExitFuture,
}

pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(
        &self,
        index: usize,
        generation: u64,
    ) -> impl Future<Output = Result<LaunchedWorker, LaunchError>> + Send;
}

/// Runs each worker as a child process with the control channel on its
/// stdin/stdout.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    template: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, template: WorkerConfig) -> Self {
        Self {
            program: program.into(),
            template,
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Worker `index` answers to its index and, when the template has a
    /// network listener, binds the template port plus the index.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        let mut config = self.template.clone();
        config.server_id = index.to_string();
        config.net_bind = self.template.net_bind.and_then(|addr| {
            let offset = u16::try_from(index).ok()?;
            match addr.port() {
                0 => None,
                port => Some(SocketAddr::new(addr.ip(), port.checked_add(offset)?)),
            }
        });
        config
    }
}

impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, index: usize, generation: u64) -> Result<LaunchedWorker, LaunchError> {
        let config = self.worker_config(index);
        let mut child = Command::new(&self.program)
            .envs(config.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn { index, source })?;
        let control_out = child
            .stdin
            .take()
            .ok_or(LaunchError::MissingPipe { index, pipe: "stdin" })?;
        let control_in = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe { index, pipe: "stdout" })?;
        info!(index, generation, pid = child.id(), "worker process started");

        let exited: ExitFuture = Box::pin(async move {
            match child.wait().await {
                Ok(status) => info!(index, generation, %status, "worker process exited"),
                Err(err) => debug!(index, generation, error = %err, "failed to wait on worker process"),
            }
        });
        let fallback = match (config.net_bind, config.shared_secret) {
            (Some(addr), Some(secret)) => Some((addr, secret)),
            _ => None,
        };
        Ok(LaunchedWorker {
            endpoint: Endpoint::local(&config.socket_dir, &config.server_id),
            fallback,
            control_in: Box::new(control_in),
            control_out: Box::new(control_out),
            exited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_configs_are_numbered_by_index() {
        let template = WorkerConfig {
            net_bind: Some("127.0.0.1:7100".parse().expect("addr")),
            shared_secret: Some(SharedSecret::new("s")),
            ..WorkerConfig::default()
        };
        let launcher = ProcessLauncher::new("shoal-worker", template);
        let config = launcher.worker_config(2);
        assert_eq!(config.server_id, "2");
        assert_eq!(config.net_bind, Some("127.0.0.1:7102".parse().expect("addr")));
    }

    #[test]
    fn ephemeral_net_port_is_not_shared() {
        let template = WorkerConfig {
            net_bind: Some("127.0.0.1:0".parse().expect("addr")),
            shared_secret: Some(SharedSecret::new("s")),
            ..WorkerConfig::default()
        };
        let launcher = ProcessLauncher::new("shoal-worker", template);
        assert_eq!(launcher.worker_config(1).net_bind, None);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let launcher = ProcessLauncher::new("/nonexistent/shoal-worker", WorkerConfig::default());
        match launcher.launch(0, 1).await {
            Err(LaunchError::Spawn { index: 0, .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("launch should fail"),
        }
    }
}
