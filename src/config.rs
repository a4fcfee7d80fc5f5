use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound (and fallback) for a task's timeout, in seconds.
pub const MAX_TIMEOUT_SECS: i64 = 86_400;

/// Extra time the controller waits past the task timeout so the agent can
/// kill its local process and still return partial output.
pub const CALL_GRACE: Duration = Duration::from_secs(5);

/// Ceiling shared by all controller drain steps.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Clamp a timeout into `(0, MAX_TIMEOUT_SECS]`; anything outside becomes the maximum.
pub fn normalize_timeout(secs: i64) -> i64 {
    if secs <= 0 || secs > MAX_TIMEOUT_SECS {
        MAX_TIMEOUT_SECS
    } else {
        secs
    }
}

/// Deadline for the controller's network call: normalized timeout plus [`CALL_GRACE`].
pub fn call_deadline(secs: i64) -> Duration {
    Duration::from_secs(normalize_timeout(secs) as u64) + CALL_GRACE
}

/// TLS configuration for controller/agent communication.
///
/// When enabled, both sides use mutual TLS (mTLS):
/// - Agents present their certificate and verify the controller's certificate
/// - The controller presents its certificate and verifies agent certificates
/// - Both sides must have certificates signed by the same CA
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    /// Used to verify peer certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this process's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this process's private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Name the controller expects in agent certificates.
    /// Falls back to [`DEFAULT_TLS_SERVER_NAME`] when unset.
    pub server_name: Option<String>,

    /// Allow insecure connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext mode with warning.
    /// When false and TLS files are missing, fails to start.
    pub allow_insecure: bool,
}

/// Certificate name used when agents are dialled by IP address.
pub const DEFAULT_TLS_SERVER_NAME: &str = "cron-dispatch-agent";

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }

    pub fn server_name(&self) -> &str {
        self.server_name
            .as_deref()
            .unwrap_or(DEFAULT_TLS_SERVER_NAME)
    }
}

/// HTTP/2 and TCP keep-alive settings used to detect half-open peers.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between HTTP/2 pings on an established connection.
    pub ping_interval: Duration,
    /// How long to wait for a ping acknowledgement before dropping the connection.
    pub ping_timeout: Duration,
    /// TCP-level keep-alive probe interval.
    pub tcp_keepalive: Duration,
    /// Dial timeout (controller side only).
    pub connect_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(3),
            tcp_keepalive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub tls: TlsConfig,
    pub keep_alive: KeepAliveConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5921)),
            tls: TlsConfig::default(),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub http_addr: SocketAddr,
    pub tls: TlsConfig,
    pub keep_alive: KeepAliveConfig,
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5920)),
            tls: TlsConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    pub fn new(http_addr: SocketAddr) -> Self {
        Self {
            http_addr,
            ..Default::default()
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
