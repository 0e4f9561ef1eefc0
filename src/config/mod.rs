//! Configuration module
//!
//! Decoded relay definitions, dial/listen options and the file loader. The
//! engine itself never touches the filesystem; `loader` is what a daemon or
//! the CLI uses to turn a file into [`RelayConfig`] values.

pub mod defaults;
mod loader;
mod validator;

pub use self::defaults::ENV_PREFIX;
pub use self::loader::{load_file, load_str};
pub use self::validator::validate_name;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::proxy::ProxyDescriptor;

/// Options applied when dialing destinations
///
/// Replaces a process-wide timeout: every relay carries its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialOptions {
    /// Bound on a direct dial and on reaching a SOCKS5 proxy
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: defaults::dial_timeout(),
        }
    }
}

/// Options applied to a relay's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    /// A UDP session with no inbound datagram for this long is closed
    pub udp_session_idle: Duration,
    /// An HTTP(S) connection that takes longer than this to send a request's
    /// headers is closed
    pub http_header_timeout: Duration,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            udp_session_idle: defaults::udp_session_idle(),
            http_header_timeout: defaults::http_header_timeout(),
        }
    }
}

/// A proxy entry as written in a relay definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Proxy protocol, only `socks5` is accepted
    #[serde(default = "default_proxy_protocol")]
    pub protocol: String,
    /// `host:port` of the proxy
    pub address: String,
    /// Optional username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_proxy_protocol() -> String {
    "socks5".to_string()
}

impl ProxyConfig {
    /// Attach the map key as the proxy's name
    pub fn to_descriptor(&self, name: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            name: name.to_string(),
            protocol: self.protocol.clone(),
            address: self.address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Decoded definition of one relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Unique relay name
    pub name: String,

    /// Where to listen, e.g. `tcp://127.0.0.1:8080`
    pub listener: Endpoint,

    /// Ordered destinations
    pub destinations: Vec<Endpoint>,

    /// Named SOCKS5 proxies referenced by destinations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proxies: BTreeMap<String, ProxyConfig>,

    /// TLS certificate (HTTPS listeners)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PathBuf>,

    /// TLS private key (HTTPS listeners)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,

    /// Relay-level load balancing switch
    #[serde(default = "defaults::load_balance")]
    pub loadbalance: bool,

    /// Destination indexes dialed directly in failover mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_ignore: Vec<usize>,

    /// Dial timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// HTTP(S) request header timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_timeout_secs: Option<u64>,
}

impl RelayConfig {
    /// Proxy descriptors with their names filled in
    pub fn proxy_descriptors(&self) -> Vec<ProxyDescriptor> {
        self.proxies
            .iter()
            .map(|(name, proxy)| proxy.to_descriptor(name))
            .collect()
    }

    /// Dial options for this relay
    pub fn dial_options(&self) -> DialOptions {
        match self.timeout_secs {
            Some(secs) => DialOptions {
                timeout: Duration::from_secs(secs),
            },
            None => DialOptions::default(),
        }
    }

    /// Listen options for this relay
    pub fn listen_options(&self) -> ListenOptions {
        let mut options = ListenOptions::default();
        if let Some(secs) = self.header_timeout_secs {
            options.http_header_timeout = Duration::from_secs(secs);
        }
        options
    }
}

/// Contents of a relays file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelaysFile {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Dial timeout applied to relays that do not set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Relay definitions
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
}
