//! Relay aggregate
//!
//! A [`Relay`] owns one listen endpoint, an ordered list of destinations, the
//! proxies those destinations may name, and the live state shared by its
//! connection handlers: the running flag, the shutdown trigger and the
//! connection pool, all behind a single mutex.
//!
//! # Example
//!
//! ```no_run
//! use localrelay::{Endpoint, Relay, Result};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<()> {
//! let relay = Relay::new(
//!     "example",
//!     Endpoint::parse("tcp://127.0.0.1:9100")?,
//!     vec![Endpoint::parse("tcp://127.0.0.1:9200")?],
//! )?;
//!
//! let relay = Arc::new(relay);
//! relay.listen_serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod coupler;
pub mod dial;
pub mod http;
pub mod selector;
pub mod tcp;
pub mod udp;

use log::info;
use openssl::ssl::SslAcceptor;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::common::{RelayError, Result};
use crate::config::{validate_name, DialOptions, ListenOptions, RelayConfig};
use crate::endpoint::{Endpoint, Protocol};
use crate::metrics::Metrics;
use crate::pool::{ConnHandle, ConnToken, ConnectionPool, PooledConnection};
use crate::proxy::ProxyRegistry;
use crate::tls::create_tls_acceptor;

pub use self::udp::UdpListener;

/// Certificate and key used by HTTPS relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub certificate: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

#[derive(Debug, Default)]
struct RelayState {
    running: bool,
    shutdown: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
    pool: ConnectionPool,
}

/// A bound listener waiting for its accept loop
pub(crate) struct Bound {
    listener: BoundListener,
    shutdown: oneshot::Receiver<()>,
}

enum BoundListener {
    Tcp(TcpListener),
    Udp(UdpListener),
    Http(TcpListener, Option<Arc<SslAcceptor>>),
}

/// One configured listen-and-forward unit
pub struct Relay {
    name: String,
    listener: Endpoint,
    destinations: Vec<Endpoint>,
    proxies: ProxyRegistry,
    tls: Option<TlsFiles>,
    load_balance: bool,
    proxy_ignore: Vec<usize>,
    dial: DialOptions,
    listen: ListenOptions,
    http_client: reqwest::Client,
    metrics: Arc<Metrics>,
    state: Mutex<RelayState>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("name", &self.name)
            .field("listener", &self.listener)
            .field("destinations", &self.destinations)
            .field("load_balance", &self.load_balance)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay
    ///
    /// # Errors
    ///
    /// * [`RelayError::InvalidName`] if `name` is not a valid identifier
    /// * [`RelayError::NoDestination`] if `destinations` is empty
    /// * [`RelayError::TooManyDestinations`] for an HTTP(S) relay with more
    ///   than one destination
    /// * [`RelayError::MissingPort`] for a tcp/udp endpoint without a port
    pub fn new(name: &str, listener: Endpoint, destinations: Vec<Endpoint>) -> Result<Self> {
        validate_name(name)?;

        let first = destinations.first().ok_or(RelayError::NoDestination)?;
        let http = listener.protocol().is_http() || first.protocol().is_http();
        if http && destinations.len() > 1 {
            return Err(RelayError::TooManyDestinations);
        }
        if listener.protocol().is_http() && !first.protocol().is_http() {
            return Err(RelayError::UnsupportedProtocol(format!(
                "{} destination for an {} relay",
                first.protocol(),
                listener.protocol()
            )));
        }

        listener.require_address()?;
        for destination in &destinations {
            destination.require_address()?;
        }

        let dial = DialOptions::default();

        Ok(Self {
            name: name.to_string(),
            listener,
            destinations,
            proxies: ProxyRegistry::default(),
            tls: None,
            load_balance: crate::config::defaults::load_balance(),
            proxy_ignore: Vec::new(),
            dial,
            listen: ListenOptions::default(),
            http_client: http::default_client(dial.timeout)?,
            metrics: Arc::new(Metrics::new(name)),
            state: Mutex::new(RelayState::default()),
        })
    }

    /// Build a relay from a decoded definition
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let mut relay = Self::new(&config.name, config.listener.clone(), config.destinations.clone())?;

        relay.set_dial_options(config.dial_options())?;
        relay.set_listen_options(config.listen_options());
        relay.set_proxies(ProxyRegistry::new(config.proxy_descriptors())?);
        relay.set_load_balance(config.loadbalance);
        relay.disable_proxy(&config.proxy_ignore);

        match (&config.certificate, &config.key) {
            (Some(certificate), Some(key)) => relay.set_tls(certificate, key),
            (None, None) => {}
            _ => {
                return Err(RelayError::Config(format!(
                    "relay {:?} needs both a certificate and a key",
                    config.name
                )))
            }
        }

        if relay.listener.protocol() == Protocol::Https && relay.tls.is_none() {
            return Err(RelayError::Config(format!(
                "https relay {:?} needs a certificate and key",
                config.name
            )));
        }

        Ok(relay)
    }

    /// Set the proxies destinations may reference by name
    pub fn set_proxies(&mut self, proxies: ProxyRegistry) {
        self.proxies = proxies.with_timeout(self.dial.timeout);
    }

    /// Set the certificate and key for an HTTPS relay
    pub fn set_tls(&mut self, certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) {
        self.tls = Some(TlsFiles {
            certificate: certificate.into(),
            key: key.into(),
        });
    }

    /// Switch relay-level weighted load balancing on or off
    pub fn set_load_balance(&mut self, enabled: bool) {
        self.load_balance = enabled;
    }

    /// Dial these destinations (by index) directly even if they name proxies
    ///
    /// Only honoured while load balancing is off.
    pub fn disable_proxy(&mut self, indices: &[usize]) {
        self.proxy_ignore = indices.to_vec();
    }

    /// Replace the dial options; also rebuilds the default HTTP client
    pub fn set_dial_options(&mut self, options: DialOptions) -> Result<()> {
        self.dial = options;
        self.proxies = self.proxies.clone().with_timeout(options.timeout);
        self.http_client = http::default_client(options.timeout)?;
        Ok(())
    }

    /// Replace the listener options
    pub fn set_listen_options(&mut self, options: ListenOptions) {
        self.listen = options;
    }

    /// Listener options
    pub fn listen_options(&self) -> &ListenOptions {
        &self.listen
    }

    /// Use a custom client for direct HTTP(S) requests
    pub fn set_http_client(&mut self, client: reqwest::Client) {
        self.http_client = client;
    }

    /// Relay name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listen endpoint
    pub fn listener(&self) -> &Endpoint {
        &self.listener
    }

    /// Destinations in configured order
    pub fn destinations(&self) -> &[Endpoint] {
        &self.destinations
    }

    /// Proxy registry
    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    /// Dial options
    pub fn dial_options(&self) -> &DialOptions {
        &self.dial
    }

    /// Whether relay-level load balancing is on
    pub fn load_balance(&self) -> bool {
        self.load_balance
    }

    /// Whether the destination at `index` bypasses its proxies
    pub fn proxy_ignored(&self, index: usize) -> bool {
        self.proxy_ignore.contains(&index)
    }

    /// Client used for direct HTTP(S) requests
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Live metrics
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the relay currently owns a listener
    pub fn running(&self) -> bool {
        self.state().running
    }

    /// Address of the bound listener while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }

    /// Bind the listen endpoint and serve until [`close`](Self::close)
    ///
    /// Returns `Ok(())` when the listener is closed; bind failures and
    /// configuration problems are returned as errors.
    pub async fn listen_serve(self: &Arc<Self>) -> Result<()> {
        let bound = self.bind().await?;
        Arc::clone(self).run(bound).await
    }

    /// Serve on a listener the caller already bound
    ///
    /// Only stream relays (tcp, http, https) can be served this way.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        let listener = match self.listener.protocol() {
            Protocol::Tcp => BoundListener::Tcp(listener),
            Protocol::Http | Protocol::Https => BoundListener::Http(listener, self.tls_acceptor()?),
            Protocol::Udp => {
                return Err(RelayError::UnsupportedProtocol(
                    "udp relays bind their own socket".to_string(),
                ))
            }
        };

        let shutdown = self.begin(local)?;
        Arc::clone(self).run(Bound { listener, shutdown }).await
    }

    /// Bind the listen endpoint and mark the relay running
    pub(crate) async fn bind(&self) -> Result<Bound> {
        if self.running() {
            return Err(RelayError::AlreadyRunning);
        }

        let address = self.listener.require_address()?;
        let (listener, local) = match self.listener.protocol() {
            Protocol::Tcp => {
                let listener = TcpListener::bind(&address).await?;
                let local = listener.local_addr()?;
                (BoundListener::Tcp(listener), local)
            }
            Protocol::Udp => {
                let listener = UdpListener::bind(&address, self.listen.udp_session_idle).await?;
                let local = listener.local_addr()?;
                (BoundListener::Udp(listener), local)
            }
            Protocol::Http | Protocol::Https => {
                let acceptor = self.tls_acceptor()?;
                let listener = TcpListener::bind(&address).await?;
                let local = listener.local_addr()?;
                (BoundListener::Http(listener, acceptor), local)
            }
        };

        let shutdown = self.begin(local)?;
        Ok(Bound { listener, shutdown })
    }

    /// Run the accept loop for a bound listener
    pub(crate) async fn run(self: Arc<Self>, bound: Bound) -> Result<()> {
        info!("[{}] Starting on {}", self.name, self.listener);

        let result = match bound.listener {
            BoundListener::Tcp(listener) => {
                tcp::accept_loop(Arc::clone(&self), listener, bound.shutdown).await
            }
            BoundListener::Udp(listener) => {
                udp::accept_loop(Arc::clone(&self), listener, bound.shutdown).await
            }
            BoundListener::Http(listener, tls) => {
                http::accept_loop(Arc::clone(&self), listener, tls, bound.shutdown).await
            }
        };

        self.finish();
        info!("[{}] Stopped", self.name);
        result
    }

    /// Close the listener
    ///
    /// In-flight connections keep running; use [`drop_all`](Self::drop_all)
    /// to end them.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotRunning`] if there is no listener to close.
    pub fn close(&self) -> Result<()> {
        let shutdown = self.state().shutdown.take().ok_or(RelayError::NotRunning)?;
        // The accept loop may already be gone
        let _ = shutdown.send(());
        Ok(())
    }

    fn tls_acceptor(&self) -> Result<Option<Arc<SslAcceptor>>> {
        if self.listener.protocol() != Protocol::Https {
            return Ok(None);
        }

        let tls = self.tls.as_ref().ok_or_else(|| {
            RelayError::Config(format!("https relay {:?} has no certificate", self.name))
        })?;
        Ok(Some(Arc::new(create_tls_acceptor(&tls.certificate, &tls.key)?)))
    }

    fn begin(&self, local: SocketAddr) -> Result<oneshot::Receiver<()>> {
        let mut state = self.state();
        if state.running {
            return Err(RelayError::AlreadyRunning);
        }

        let (tx, rx) = oneshot::channel();
        state.running = true;
        state.shutdown = Some(tx);
        state.local_addr = Some(local);
        Ok(rx)
    }

    fn finish(&self) {
        let mut state = self.state();
        state.running = false;
        state.shutdown = None;
        state.local_addr = None;
    }

    pub(crate) fn store_conn(&self, conn: ConnHandle) -> ConnToken {
        self.state().pool.store(conn)
    }

    pub(crate) fn remove_conn(&self, token: ConnToken) {
        self.state().pool.remove(token);
    }

    pub(crate) fn update_remote(&self, token: ConnToken, remote: &str) {
        self.state().pool.update_remote(token, remote);
    }

    /// Copy of the live connections
    pub fn connections(&self) -> Vec<PooledConnection> {
        self.state().pool.snapshot()
    }

    /// Close every live connection, returning how many were signalled
    pub fn drop_all(&self) -> usize {
        self.drop_matching(|_| true)
    }

    /// Close every live connection from `ip`
    pub fn drop_ip(&self, ip: IpAddr) -> usize {
        self.drop_matching(|entry| entry.conn.peer_addr().ip() == ip)
    }

    fn drop_matching<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&PooledConnection) -> bool,
    {
        // Entries leave the pool when their handlers finish
        let mut dropped = 0;
        for entry in self.connections() {
            if matches(&entry) {
                entry.conn.close();
                dropped += 1;
            }
        }
        dropped
    }
}
