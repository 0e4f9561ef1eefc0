//! Localrelay: reverse relay for TCP, UDP, HTTP and HTTPS
//!
//! A relay accepts traffic on a local listener and forwards it to one or
//! more destinations, optionally through named SOCKS5 proxies, with ordered
//! failover, weighted load balancing and live traffic and dial metrics. It
//! lets unmodified local clients reach services they could not otherwise
//! address, such as onion services behind a Tor SOCKS port.
//!
//! # Main Features
//!
//! - Endpoints written as `scheme://host:port?proxy=a,b&lb=off&lb_weight=50`
//! - Failover across destinations and across each destination's proxies
//! - Weighted random destination selection
//! - Per-relay metrics and a live connection pool with forced close
//! - HTTPS termination with OpenSSL
//!
//! # Example
//!
//! ```no_run
//! use localrelay::{Endpoint, ProxyDescriptor, ProxyRegistry, Relay, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut relay = Relay::new(
//!         "onion",
//!         Endpoint::parse("tcp://127.0.0.1:8080")?,
//!         vec![Endpoint::parse("tcp://example.onion:80?proxy=tor")?],
//!     )?;
//!     relay.set_proxies(ProxyRegistry::new([ProxyDescriptor::socks5("tor", "127.0.0.1:9050")])?);
//!
//!     Arc::new(relay).listen_serve().await
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod endpoint;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use common::{init_logger, RelayError, Result};
pub use endpoint::{Endpoint, Protocol};
pub use manager::{ConnectionInfo, RelayManager, RelayStatus};
pub use self::metrics::{Metrics, MetricsSnapshot};
pub use pool::PooledConnection;
pub use proxy::{ProxyDescriptor, ProxyRegistry};
pub use relay::Relay;
pub use tls::create_tls_acceptor;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
