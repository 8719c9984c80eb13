use anyhow::Result;
use shoal_worker::WorkerConfig;
use shoal_worker::config::parsed;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_NUM_WORKERS: &str = "SHOAL_NUM_WORKERS";
pub const ENV_POLL_INTERVAL_MS: &str = "SHOAL_POLL_INTERVAL_MS";
pub const ENV_RESPAWN_DELAY_MS: &str = "SHOAL_RESPAWN_DELAY_MS";
pub const ENV_CALL_TIMEOUT_MS: &str = "SHOAL_CALL_TIMEOUT_MS";
pub const ENV_RETRY_INTERVAL_MS: &str = "SHOAL_RETRY_INTERVAL_MS";
pub const ENV_WORKER_BIN: &str = "SHOAL_WORKER_BIN";

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RESPAWN_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WORKER_BIN: &str = "shoal-worker";

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub num_workers: usize,
    /// How often `getConcurrent` is polled on every connected worker.
    pub poll_interval: Duration,
    /// Pause between a worker going down and its relaunch.
    pub respawn_delay: Duration,
    /// Per-call deadline on worker channels; `None` waits forever.
    /// `SHOAL_CALL_TIMEOUT_MS=0` turns it off.
    pub call_timeout: Option<Duration>,
    /// Reconnect cadence while a worker's socket is not yet accepting.
    pub retry_interval: Duration,
    /// Executable started by the process launcher.
    pub worker_program: PathBuf,
    /// Template for every worker; `server_id` is replaced by the worker index.
    pub worker: WorkerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: default_workers(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            respawn_delay: Duration::from_millis(DEFAULT_RESPAWN_DELAY_MS),
            call_timeout: Some(Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            worker_program: PathBuf::from(DEFAULT_WORKER_BIN),
            worker: WorkerConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let worker = WorkerConfig::from_lookup(&lookup)?;
        let millis = |key: &str, fallback: Duration| -> Result<Duration> {
            Ok(parsed::<u64, _>(&lookup, key)?
                .map(Duration::from_millis)
                .unwrap_or(fallback))
        };

        Ok(Self {
            num_workers: parsed::<usize, _>(&lookup, ENV_NUM_WORKERS)?
                .filter(|count| *count > 0)
                .unwrap_or(defaults.num_workers),
            poll_interval: millis(ENV_POLL_INTERVAL_MS, defaults.poll_interval)?.max(Duration::from_millis(1)),
            respawn_delay: millis(ENV_RESPAWN_DELAY_MS, defaults.respawn_delay)?,
            call_timeout: match parsed::<u64, _>(&lookup, ENV_CALL_TIMEOUT_MS)? {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.call_timeout,
            },
            retry_interval: millis(ENV_RETRY_INTERVAL_MS, defaults.retry_interval)?.max(Duration::from_millis(1)),
            worker_program: lookup(ENV_WORKER_BIN)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.worker_program),
            worker,
        })
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}
