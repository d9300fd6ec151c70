//! Connection configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::request::Request;

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
        }
    }
}

impl Default for Address {
    fn default() -> Address {
        Address::new("", 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which server role Sentinel discovery should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRole {
    #[default]
    Master,
    Replica,
}

/// Sentinel-based discovery. Enabled when `addresses` is non-empty.
#[derive(Debug, Clone, Default)]
pub struct SentinelConfig {
    /// Bootstrap sentinel addresses. After a successful resolution the list
    /// is reordered: the sentinel that answered first, then the gossiped
    /// sentinels, then any bootstrap address missing from that union.
    pub addresses: Vec<Address>,
    /// Master name to resolve.
    pub master_name: String,
    /// Whether to connect to the master or to one of its replicas.
    pub server_role: ServerRole,
    /// Commands sent to each sentinel before the discovery commands,
    /// typically authentication.
    pub setup: Request,
    /// Seed for the deterministic rotation of `addresses` and for replica
    /// selection.
    pub rotation_seed: u64,
}

/// Everything [`Connection::run`](crate::Connection::run) needs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target server. Overridden by Sentinel resolution when enabled.
    pub addr: Address,
    /// Connect over a Unix domain socket instead of TCP. Mutually
    /// exclusive with `use_ssl`.
    pub unix_socket: Option<PathBuf>,
    /// Wrap the TCP stream in TLS after connecting.
    pub use_ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Fed into `HELLO ... SETNAME`.
    pub clientname: Option<String>,
    /// If non-zero, `SELECT` is appended to the handshake.
    pub database_index: i64,
    /// User-provided request appended to the handshake.
    pub setup: Option<Request>,
    pub resolve_timeout: Duration,
    pub connect_timeout: Duration,
    pub ssl_handshake_timeout: Duration,
    /// PING cadence; zero disables the health checker.
    pub health_check_interval: Duration,
    /// Argument appended to health-check PINGs.
    pub health_check_id: String,
    /// Delay before reconnecting; zero makes the first failure terminal.
    pub reconnect_wait_interval: Duration,
    /// Upper bound on read-buffer growth.
    pub max_read_buffer: usize,
    /// Prefix attached to every log event of this connection.
    pub log_prefix: String,
    pub sentinel: SentinelConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: Address::new("127.0.0.1", 6379),
            unix_socket: None,
            use_ssl: false,
            username: None,
            password: None,
            clientname: None,
            database_index: 0,
            setup: None,
            resolve_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            ssl_handshake_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(2),
            health_check_id: "redis-mux".to_owned(),
            reconnect_wait_interval: Duration::from_secs(1),
            max_read_buffer: usize::MAX,
            log_prefix: "redis-mux".to_owned(),
            sentinel: SentinelConfig::default(),
        }
    }
}
