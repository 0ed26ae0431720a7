// ABOUTME: Daemon connection handles and the strategies used to open them
// ABOUTME: Defines the Connector seam plus the bollard-backed DockerConnector

//! Daemon connections.
//!
//! A [`Connection`] wraps whatever client the [`Connector`] produces and is
//! owned by exactly one party at a time: the pool while idle, a caller while
//! in use. The production connector, [`DockerConnector`], walks an ordered
//! list of [`ConnectStrategy`] values and keeps the first one whose client
//! answers a ping.
//!
//! # Strategy order
//!
//! ```text
//!  configured host ──▶ $DOCKER_HOST ──▶ well-known sockets ──▶ local defaults
//!        │                  │                  │                     │
//!        └──── first client that answers a ping wins; otherwise the ─┘
//!                      last failure is surfaced to the pool
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bollard::Docker;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// === Errors ===

/// Failures while opening or probing a daemon connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Error reported by the Docker client library
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Daemon did not answer in time
    #[error("Daemon did not answer within {0:?}")]
    Timeout(Duration),

    /// A socket strategy pointed at a path that does not exist
    #[error("Docker socket not found: {}", .0.display())]
    SocketMissing(PathBuf),

    /// Host string with a scheme this platform cannot dial
    #[error("Unsupported Docker host: {0}")]
    UnsupportedHost(String),

    /// `DOCKER_HOST` was requested but is not set
    #[error("DOCKER_HOST is not set")]
    EnvironmentUnset,

    /// Strategy list was empty
    #[error("No connection strategies configured")]
    NoStrategies,

    /// Daemon refused or dropped the connection
    #[error("Daemon unreachable: {0}")]
    Unreachable(String),
}

// === Connector Seam ===

/// Opens daemon clients and checks that an existing one still answers.
///
/// The pool is generic over this trait so tests can substitute an in-memory
/// daemon.
pub trait Connector: Send + Sync + 'static {
    /// Client handle produced for each pooled connection.
    type Client: Send + Sync + 'static;

    /// Open a new client. Must not hold any pool lock while running.
    fn connect(&self) -> impl Future<Output = Result<Self::Client, ConnectError>> + Send;

    /// Minimal round trip proving `client` still works.
    fn ping(
        &self,
        client: &Self::Client,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ConnectError>> + Send;
}

// === Connection Handle ===

/// Identifier assigned to each connection when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A pooled daemon connection
#[derive(Debug)]
pub struct Connection<T> {
    id: ConnectionId,
    client: T,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl<T> Connection<T> {
    pub(crate) fn new(client: T) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            client,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    /// Unique id of this connection
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Borrow the underlying client
    pub const fn client(&self) -> &T {
        &self.client
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last handed out or returned
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Number of times the connection has been handed to a caller
    pub const fn use_count(&self) -> u64 {
        self.use_count
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn mark_returned(&mut self) {
        self.last_used = Instant::now();
    }
}

// === Docker Connector ===

/// One way of reaching the Docker daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// Explicit host string from configuration (`unix://`, `tcp://`, `http://`)
    Host(String),
    /// Whatever `DOCKER_HOST` holds when the connection is opened
    EnvironmentHost,
    /// A Unix socket path; skipped when the path does not exist
    Socket(PathBuf),
    /// bollard's platform defaults
    LocalDefaults,
}

impl ConnectStrategy {
    /// Build the standard strategy chain for this platform.
    #[must_use]
    pub fn default_chain(configured_host: Option<&str>) -> Vec<Self> {
        let mut chain = Vec::new();

        if let Some(host) = configured_host {
            chain.push(Self::Host(host.to_string()));
        }
        chain.push(Self::EnvironmentHost);
        chain.extend(well_known_sockets().into_iter().map(Self::Socket));
        chain.push(Self::LocalDefaults);

        chain
    }

    fn open(&self, timeout_secs: u64) -> Result<Docker, ConnectError> {
        match self {
            Self::Host(host) => connect_host(host, timeout_secs),
            Self::EnvironmentHost => {
                let host = std::env::var("DOCKER_HOST").map_err(|_| ConnectError::EnvironmentUnset)?;
                connect_host(&host, timeout_secs)
            }
            Self::Socket(path) => {
                if !path.exists() {
                    return Err(ConnectError::SocketMissing(path.clone()));
                }
                connect_host(&format!("unix://{}", path.display()), timeout_secs)
            }
            Self::LocalDefaults => Ok(Docker::connect_with_local_defaults()?),
        }
    }
}

impl std::fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(host) => write!(f, "host {host}"),
            Self::EnvironmentHost => write!(f, "DOCKER_HOST"),
            Self::Socket(path) => write!(f, "socket {}", path.display()),
            Self::LocalDefaults => write!(f, "local defaults"),
        }
    }
}

fn connect_host(host: &str, timeout_secs: u64) -> Result<Docker, ConnectError> {
    if host.starts_with("tcp://") || host.starts_with("http://") {
        return Ok(Docker::connect_with_http(
            host,
            timeout_secs,
            bollard::API_DEFAULT_VERSION,
        )?);
    }

    #[cfg(unix)]
    if host.starts_with("unix://") {
        return Ok(Docker::connect_with_unix(
            host,
            timeout_secs,
            bollard::API_DEFAULT_VERSION,
        )?);
    }

    #[cfg(windows)]
    if host.starts_with("npipe://") {
        return Ok(Docker::connect_with_named_pipe(
            host,
            timeout_secs,
            bollard::API_DEFAULT_VERSION,
        )?);
    }

    Err(ConnectError::UnsupportedHost(host.to_string()))
}

fn well_known_sockets() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if cfg!(target_os = "linux") {
        paths.push(PathBuf::from("/var/run/docker.sock"));

        // Rootless Docker
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            paths.push(PathBuf::from(runtime_dir).join("docker.sock"));
        }
    }

    if let Some(home) = dirs::home_dir() {
        if cfg!(target_os = "macos") {
            // Docker Desktop for Mac
            paths.push(home.join(".docker").join("run").join("docker.sock"));
        }
        // Colima
        paths.push(home.join(".colima").join("default").join("docker.sock"));
    }

    paths
}

/// Connector that opens bollard clients against the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerConnector {
    strategies: Vec<ConnectStrategy>,
    connect_timeout: Duration,
}

impl DockerConnector {
    /// Create a connector with an explicit strategy list
    #[must_use]
    pub const fn new(strategies: Vec<ConnectStrategy>, connect_timeout: Duration) -> Self {
        Self {
            strategies,
            connect_timeout,
        }
    }

    /// Create a connector using the platform's standard strategy chain
    #[must_use]
    pub fn from_host(configured_host: Option<&str>, connect_timeout: Duration) -> Self {
        Self::new(ConnectStrategy::default_chain(configured_host), connect_timeout)
    }

    /// Strategies in the order they are tried
    pub fn strategies(&self) -> &[ConnectStrategy] {
        &self.strategies
    }

    async fn ping_docker(docker: &Docker, timeout: Duration) -> Result<(), ConnectError> {
        tokio::time::timeout(timeout, docker.ping())
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;
        Ok(())
    }
}

impl Connector for DockerConnector {
    type Client = Docker;

    async fn connect(&self) -> Result<Docker, ConnectError> {
        let timeout_secs = self.connect_timeout.as_secs().max(1);
        let mut last_error = ConnectError::NoStrategies;

        for strategy in &self.strategies {
            let docker = match strategy.open(timeout_secs) {
                Ok(docker) => docker,
                Err(e) => {
                    debug!(strategy = %strategy, error = %e, "Connect strategy unavailable");
                    last_error = e;
                    continue;
                }
            };

            match Self::ping_docker(&docker, self.connect_timeout).await {
                Ok(()) => {
                    info!(strategy = %strategy, "Opened Docker daemon connection");
                    return Ok(docker);
                }
                Err(e) => {
                    warn!(strategy = %strategy, error = %e, "Docker daemon did not answer");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn ping(&self, client: &Docker, timeout: Duration) -> Result<(), ConnectError> {
        Self::ping_docker(client, timeout).await
    }
}
