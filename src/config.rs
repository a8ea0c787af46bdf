//! Configuration loading.
//!
//! Sources, later ones win:
//!
//! 1. Built-in defaults.
//! 2. A JSON file: `--config PATH`, else `$BOTSTER_RELAY_CONFIG`.
//! 3. `BOTSTER_RELAY_*` environment variables.
//! 4. Command line flags (applied by the binary).
//!
//! Durations are written as integer milliseconds. Missing fields keep
//! their defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ACK_INTERVAL, CLIENT_CONN_WRITE_TIMEOUT, CLIENT_TRANSPORT_WRITE_TIMEOUT, DEFAULT_BUFFER_SIZE,
    DEFAULT_LISTEN, DEFAULT_MAX_RECEIVE_WINDOW, DEFAULT_MAX_SEND_WINDOW, MIN_WINDOW,
    PING_INTERVAL, PING_TIMEOUT, POOL_MAX_IDLE, RESOLUTION_TIMEOUT, SERVER_CONN_WRITE_TIMEOUT,
    SERVER_TRANSPORT_WRITE_TIMEOUT, TICKET_TTL,
};
use crate::counters::{EndpointCounters, TransportCounters};
use crate::endpoint::{EndpointContext, Timeouts};
use crate::error::Error;
use crate::filter::GlobFilter;
use crate::retry::RetryPolicy;
use crate::session::ExpirationPolicy;
use crate::window::BufferPool;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BOTSTER_RELAY_CONFIG";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BOTSTER_RELAY_";

/// `#[serde(with = "duration_ms")]`: a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde shape of [`Timeouts`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Longest wait before a pure ack is flushed.
    #[serde(with = "duration_ms")]
    pub ack_interval: Duration,
    /// Keepalive ping period.
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    /// Longest silence tolerated from the peer.
    #[serde(with = "duration_ms")]
    pub ping_timeout: Duration,
    /// Bound on each WebSocket write.
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    /// Bound on each application or downstream write.
    #[serde(with = "duration_ms")]
    pub conn_write_timeout: Duration,
}

impl TimeoutConfig {
    /// Client side defaults.
    pub fn client() -> Self {
        Self {
            ack_interval: ACK_INTERVAL,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            write_timeout: CLIENT_TRANSPORT_WRITE_TIMEOUT,
            conn_write_timeout: CLIENT_CONN_WRITE_TIMEOUT,
        }
    }

    /// Server side defaults.
    pub fn server() -> Self {
        Self {
            ack_interval: ACK_INTERVAL,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            write_timeout: SERVER_TRANSPORT_WRITE_TIMEOUT,
            conn_write_timeout: SERVER_CONN_WRITE_TIMEOUT,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::client()
    }
}

impl From<TimeoutConfig> for Timeouts {
    fn from(config: TimeoutConfig) -> Self {
        Self {
            ack_interval: config.ack_interval,
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            write_timeout: config.write_timeout,
            conn_write_timeout: config.conn_write_timeout,
        }
    }
}

/// Client (`connect`) settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the relay server, `http(s)://host[:port]`.
    pub proxy: String,
    /// `Origin` header sent with every request.
    pub origin: String,
    /// Endpoint timing.
    pub timeouts: TimeoutConfig,
    /// Reconnect backoff.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy: String::new(),
            origin: "chrome://botster-relay".to_string(),
            timeouts: TimeoutConfig::client(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Server (`serve`) settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: String,
    /// Accepted `Origin` prefixes. Empty disables the check.
    pub allowed_origins: Vec<String>,
    /// `host:port` globs that may be dialed. Empty allows all.
    pub allow: Vec<String>,
    /// `host:port` globs that may never be dialed.
    pub deny: Vec<String>,
    /// Endpoint timing.
    pub timeouts: TimeoutConfig,
    /// Bound on dialing the destination.
    #[serde(with = "duration_ms")]
    pub resolution_timeout: Duration,
    /// How long an unused sid stays valid.
    #[serde(with = "duration_ms")]
    pub ticket_ttl: Duration,
    /// Orphan expiration.
    pub expiration: ExpirationPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            allowed_origins: vec!["chrome-extension://".to_string(), "chrome://".to_string()],
            allow: vec!["localhost:22".to_string(), "127.0.0.1:22".to_string()],
            deny: Vec::new(),
            timeouts: TimeoutConfig::server(),
            resolution_timeout: RESOLUTION_TIMEOUT,
            ticket_ttl: TICKET_TTL,
            expiration: ExpirationPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Compile the allow/deny patterns.
    pub fn filter(&self) -> Result<GlobFilter, Error> {
        GlobFilter::new(&self.allow, &self.deny)
    }
}

/// Configuration for the relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Size of each pooled buffer.
    pub buffer_size: usize,
    /// Cap on unacknowledged outgoing bytes per stream.
    pub max_send_window: u64,
    /// Cap on undelivered incoming bytes per stream.
    pub max_receive_window: u64,
    /// Client settings.
    pub client: ClientConfig,
    /// Server settings.
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_send_window: DEFAULT_MAX_SEND_WINDOW,
            max_receive_window: DEFAULT_MAX_RECEIVE_WINDOW,
            client: ClientConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load defaults, the config file and environment overrides, then
    /// validate.
    ///
    /// An explicit `path` (or `$BOTSTER_RELAY_CONFIG`) must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `BOTSTER_RELAY_*` overrides, looking variables up with `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(listen) = var("LISTEN") {
            self.server.listen = listen;
        }
        if let Some(proxy) = var("PROXY") {
            self.client.proxy = proxy;
        }
        if let Some(origin) = var("ORIGIN") {
            self.client.origin = origin;
        }
        if let Some(size) = var("BUFFER_SIZE") {
            self.buffer_size = size
                .parse()
                .with_context(|| format!("{ENV_PREFIX}BUFFER_SIZE={size}"))?;
        }
        if let Some(size) = var("MAX_SEND_WINDOW") {
            self.max_send_window = size
                .parse()
                .with_context(|| format!("{ENV_PREFIX}MAX_SEND_WINDOW={size}"))?;
        }
        if let Some(size) = var("MAX_RECEIVE_WINDOW") {
            self.max_receive_window = size
                .parse()
                .with_context(|| format!("{ENV_PREFIX}MAX_RECEIVE_WINDOW={size}"))?;
        }
        Ok(())
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_size < MIN_WINDOW as usize {
            return Err(Error::Config(format!(
                "buffer_size {} is below {MIN_WINDOW}",
                self.buffer_size
            )));
        }
        for (name, value) in [
            ("max_send_window", self.max_send_window),
            ("max_receive_window", self.max_receive_window),
        ] {
            if value < MIN_WINDOW {
                return Err(Error::Config(format!("{name} {value} is below {MIN_WINDOW}")));
            }
        }
        for (side, timeouts) in [("client", &self.client.timeouts), ("server", &self.server.timeouts)]
        {
            if timeouts.ping_interval.is_zero() {
                return Err(Error::Config(format!("{side} ping_interval must be positive")));
            }
        }
        self.server.filter()?;
        Ok(())
    }

    /// Shared endpoint settings with the given timeouts and fresh counters.
    pub fn endpoint_context(&self, timeouts: TimeoutConfig) -> EndpointContext {
        EndpointContext {
            pool: Arc::new(BufferPool::with_max_idle(self.buffer_size, POOL_MAX_IDLE)),
            max_send_window: self.max_send_window,
            max_receive_window: self.max_receive_window,
            timeouts: timeouts.into(),
            counters: Arc::new(EndpointCounters::default()),
            transport_counters: Arc::new(TransportCounters::default()),
        }
    }
}
