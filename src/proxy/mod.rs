//! Proxy registry
//!
//! Maps proxy names to SOCKS5 dialers. Destinations refer to proxies by name
//! (`?proxy=tor,backup`); the registry turns those names into dialers at
//! connection time. It is read-only once built, so lookups need no locking.

pub mod socks5;

pub use socks5::Socks5Dialer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::common::{RelayError, Result};

/// A named upstream proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Unique key within a relay
    pub name: String,
    /// Only `socks5` is supported
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

impl ProxyDescriptor {
    /// Describe a SOCKS5 proxy without credentials
    pub fn socks5(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol: "socks5".to_string(),
            address: address.to_string(),
            username: None,
            password: None,
        }
    }
}

/// A resolved proxy: its name and a dialer bound to it
#[derive(Debug, Clone)]
pub struct ResolvedProxy {
    /// Name the destination used
    pub name: String,
    /// Dialer for that proxy
    pub dialer: Socks5Dialer,
}

/// Name to dialer mapping owned by a relay
#[derive(Debug, Clone, Default)]
pub struct ProxyRegistry {
    proxies: HashMap<String, ProxyDescriptor>,
    dial_timeout: Option<Duration>,
}

impl ProxyRegistry {
    /// Build a registry
    ///
    /// # Errors
    ///
    /// Fails if any descriptor uses a protocol other than SOCKS5.
    pub fn new<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = ProxyDescriptor>,
    {
        let mut proxies = HashMap::new();

        for descriptor in descriptors {
            if !descriptor.protocol.eq_ignore_ascii_case("socks5") {
                return Err(RelayError::UnsupportedProxyProtocol {
                    name: descriptor.name,
                    protocol: descriptor.protocol,
                });
            }
            proxies.insert(descriptor.name.clone(), descriptor);
        }

        Ok(Self {
            proxies,
            dial_timeout: None,
        })
    }

    /// Bound on reaching each proxy
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Whether no proxies are defined
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Look up a descriptor by name
    pub fn get(&self, name: &str) -> Option<&ProxyDescriptor> {
        self.proxies.get(name)
    }

    /// Resolve proxy names into dialers, keeping their order
    ///
    /// An empty list resolves to an empty list, meaning "dial directly".
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ProxyNotDefined`] for the first unknown name,
    /// carrying the names resolved so far and the full requested list.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<ResolvedProxy>> {
        let mut resolved = Vec::with_capacity(names.len());

        for name in names {
            let Some(descriptor) = self.proxies.get(name) else {
                return Err(RelayError::ProxyNotDefined {
                    name: name.clone(),
                    resolved: resolved.into_iter().map(|p: ResolvedProxy| p.name).collect(),
                    attempted: names.to_vec(),
                });
            };

            let mut dialer = Socks5Dialer::new(
                &descriptor.address,
                descriptor.username.as_deref(),
                descriptor.password.as_deref(),
            );
            if let Some(timeout) = self.dial_timeout {
                dialer = dialer.with_timeout(timeout);
            }

            resolved.push(ResolvedProxy {
                name: name.clone(),
                dialer,
            });
        }

        Ok(resolved)
    }
}
