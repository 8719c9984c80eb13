use anyhow::{Context, Result, anyhow, bail};
use shoal_db::DEFAULT_MAX_IN_FLIGHT;
use shoal_ipc::{SharedSecret, WireCodec};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_WORKER_ID: &str = "SHOAL_WORKER_ID";
pub const ENV_DB_BACKEND: &str = "SHOAL_DB_BACKEND";
pub const ENV_DB_HOST: &str = "SHOAL_DB_HOST";
pub const ENV_DB_PORT: &str = "SHOAL_DB_PORT";
pub const ENV_DB_USER: &str = "SHOAL_DB_USER";
pub const ENV_DB_PASSWORD: &str = "SHOAL_DB_PASSWORD";
pub const ENV_DB_KEYSPACE: &str = "SHOAL_DB_KEYSPACE";
pub const ENV_DB_CONNECTIONS: &str = "SHOAL_DB_CONNECTIONS";
pub const ENV_MAX_CONCURRENT_QUERY: &str = "SHOAL_MAX_CONCURRENT_QUERY";
pub const ENV_SOCKET_DIR: &str = "SHOAL_SOCKET_DIR";
pub const ENV_NET_BIND: &str = "SHOAL_NET_BIND";
pub const ENV_SHARED_SECRET: &str = "SHOAL_SHARED_SECRET";
pub const ENV_REPORT_INTERVAL_MS: &str = "SHOAL_REPORT_INTERVAL_MS";
pub const ENV_WIRE_CODEC: &str = "SHOAL_WIRE_CODEC";

const DEFAULT_DB_HOST: &str = "127.0.0.1";
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_USER: &str = "postgres";
const DEFAULT_KEYSPACE: &str = "shoal.db";
const DEFAULT_DB_CONNECTIONS: usize = 8;
const DEFAULT_REPORT_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DbBackend {
    #[default]
    Sqlite,
    Postgres,
}

impl DbBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            DbBackend::Sqlite => "sqlite",
            DbBackend::Postgres => "postgres",
        }
    }
}

impl FromStr for DbBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DbBackend::Sqlite),
            "postgres" | "postgresql" => Ok(DbBackend::Postgres),
            other => Err(format!("Unsupported database backend '{other}'")),
        }
    }
}

// Worker process configuration sourced from environment variables.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Id the channel server answers to; also names the socket file.
    pub server_id: String,
    pub backend: DbBackend,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: Option<String>,
    /// Database name, or the database file for sqlite.
    pub keyspace: String,
    /// Size of the backend connection pool.
    pub db_connections: usize,
    /// In-flight cap of the query executor.
    pub max_concurrent_query: usize,
    pub socket_dir: PathBuf,
    /// Optional TCP listener; requires a shared secret.
    pub net_bind: Option<SocketAddr>,
    pub shared_secret: Option<SharedSecret>,
    /// How often latency is pushed to the parent.
    pub report_interval: Duration,
    pub codec: WireCodec,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: "0".to_string(),
            backend: DbBackend::default(),
            db_host: DEFAULT_DB_HOST.to_string(),
            db_port: DEFAULT_DB_PORT,
            db_user: DEFAULT_DB_USER.to_string(),
            db_password: None,
            keyspace: DEFAULT_KEYSPACE.to_string(),
            db_connections: DEFAULT_DB_CONNECTIONS,
            max_concurrent_query: DEFAULT_MAX_IN_FLIGHT,
            socket_dir: std::env::temp_dir(),
            net_bind: None,
            shared_secret: None,
            report_interval: Duration::from_millis(DEFAULT_REPORT_INTERVAL_MS),
            codec: WireCodec::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let net_bind = parsed::<SocketAddr, _>(&lookup, ENV_NET_BIND)?;
        let shared_secret = lookup(ENV_SHARED_SECRET)
            .filter(|value| !value.is_empty())
            .map(SharedSecret::new);
        if net_bind.is_some() && shared_secret.is_none() {
            bail!("{ENV_NET_BIND} is set but {ENV_SHARED_SECRET} is missing");
        }
        let report_interval_ms =
            parsed::<u64, _>(&lookup, ENV_REPORT_INTERVAL_MS)?.unwrap_or(DEFAULT_REPORT_INTERVAL_MS);

        Ok(Self {
            server_id: lookup(ENV_WORKER_ID).unwrap_or(defaults.server_id),
            backend: parsed(&lookup, ENV_DB_BACKEND)?.unwrap_or(defaults.backend),
            db_host: lookup(ENV_DB_HOST).unwrap_or(defaults.db_host),
            db_port: parsed(&lookup, ENV_DB_PORT)?.unwrap_or(defaults.db_port),
            db_user: lookup(ENV_DB_USER).unwrap_or(defaults.db_user),
            db_password: lookup(ENV_DB_PASSWORD),
            keyspace: lookup(ENV_DB_KEYSPACE).unwrap_or(defaults.keyspace),
            db_connections: parsed::<usize, _>(&lookup, ENV_DB_CONNECTIONS)?
                .filter(|value| *value > 0)
                .unwrap_or(defaults.db_connections),
            max_concurrent_query: parsed::<usize, _>(&lookup, ENV_MAX_CONCURRENT_QUERY)?
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_query),
            socket_dir: lookup(ENV_SOCKET_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_dir),
            net_bind,
            shared_secret,
            report_interval: Duration::from_millis(report_interval_ms.max(1)),
            codec: parsed(&lookup, ENV_WIRE_CODEC)?.unwrap_or(defaults.codec),
        })
    }

    /// Environment that reproduces this config in a child process.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_WORKER_ID, self.server_id.clone()),
            (ENV_DB_BACKEND, self.backend.as_str().to_string()),
            (ENV_DB_HOST, self.db_host.clone()),
            (ENV_DB_PORT, self.db_port.to_string()),
            (ENV_DB_USER, self.db_user.clone()),
            (ENV_DB_KEYSPACE, self.keyspace.clone()),
            (ENV_DB_CONNECTIONS, self.db_connections.to_string()),
            (ENV_MAX_CONCURRENT_QUERY, self.max_concurrent_query.to_string()),
            (ENV_SOCKET_DIR, self.socket_dir.display().to_string()),
            (ENV_REPORT_INTERVAL_MS, self.report_interval.as_millis().to_string()),
            (
                ENV_WIRE_CODEC,
                match self.codec {
                    WireCodec::Json => "json",
                    WireCodec::Msgpack => "msgpack",
                }
                .to_string(),
            ),
        ];
        if let Some(password) = &self.db_password {
            vars.push((ENV_DB_PASSWORD, password.clone()));
        }
        if let (Some(addr), Some(secret)) = (self.net_bind, &self.shared_secret) {
            vars.push((ENV_NET_BIND, addr.to_string()));
            vars.push((ENV_SHARED_SECRET, secret.expose().to_string()));
        }
        vars
    }
}

/// Parses `key` when it is set and non-blank; the error names the key.
pub fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|err| anyhow!("{err}"))
                .with_context(|| format!("parse {key}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = WorkerConfig::from_lookup(lookup_from(&[])).expect("config");
        assert_eq!(config.server_id, "0");
        assert_eq!(config.backend, DbBackend::Sqlite);
        assert_eq!(config.max_concurrent_query, 32768);
        assert_eq!(config.report_interval, Duration::from_secs(60));
        assert_eq!(config.codec, WireCodec::Json);
        assert!(config.net_bind.is_none());
    }

    #[test]
    fn values_are_parsed() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            (ENV_WORKER_ID, "3"),
            (ENV_DB_BACKEND, "Postgres"),
            (ENV_DB_PORT, "6543"),
            (ENV_MAX_CONCURRENT_QUERY, "12"),
            (ENV_NET_BIND, "127.0.0.1:7000"),
            (ENV_SHARED_SECRET, "s3cret"),
            (ENV_WIRE_CODEC, "msgpack"),
        ]))
        .expect("config");
        assert_eq!(config.server_id, "3");
        assert_eq!(config.backend, DbBackend::Postgres);
        assert_eq!(config.db_port, 6543);
        assert_eq!(config.max_concurrent_query, 12);
        assert_eq!(config.net_bind, Some("127.0.0.1:7000".parse().expect("addr")));
        assert_eq!(config.codec, WireCodec::Msgpack);
    }

    #[test]
    fn bad_values_name_their_key() {
        let err = WorkerConfig::from_lookup(lookup_from(&[(ENV_DB_PORT, "many")])).expect_err("port");
        assert!(format!("{err:#}").contains(ENV_DB_PORT));

        let err = WorkerConfig::from_lookup(lookup_from(&[(ENV_NET_BIND, "127.0.0.1:7000")]))
            .expect_err("secret required");
        assert!(err.to_string().contains(ENV_SHARED_SECRET));
    }

    #[test]
    fn env_vars_round_trip() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            (ENV_WORKER_ID, "5"),
            (ENV_DB_KEYSPACE, "/tmp/fish.db"),
            (ENV_NET_BIND, "127.0.0.1:7001"),
            (ENV_SHARED_SECRET, "k"),
        ]))
        .expect("config");
        let vars = config.env_vars();
        let again = WorkerConfig::from_lookup(|key| {
            vars.iter().find(|(name, _)| *name == key).map(|(_, value)| value.clone())
        })
        .expect("reparse");
        assert_eq!(again.server_id, "5");
        assert_eq!(again.keyspace, "/tmp/fish.db");
        assert_eq!(again.net_bind, config.net_bind);
        assert_eq!(again.shared_secret.map(|s| s.expose().to_string()), Some("k".to_string()));
    }
}
