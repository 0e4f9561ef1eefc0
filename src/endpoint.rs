//! Endpoint descriptors
//!
//! An endpoint is written as `scheme://host:port?query`, for example
//! `tcp://example.onion:80?proxy=tor,backup&lb_weight=50`. The same
//! notation is used for a relay's listener and for each destination.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use url::{form_urlencoded, Host, Url};

use crate::common::{RelayError, Result};
use crate::config::defaults;

/// Values of the `lb` query parameter that switch load balancing off
const LB_DISABLED_VALUES: &[&str] = &["false", "off", "disabled", "inactive", "0", "no"];

/// Transport an endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Raw TCP stream
    Tcp,
    /// UDP datagrams
    Udp,
    /// Plain HTTP
    Http,
    /// HTTP over TLS
    Https,
}

impl Protocol {
    /// Port implied by the scheme when none is written
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Http => Some(80),
            Self::Https => Some(443),
            Self::Tcp | Self::Udp => None,
        }
    }

    /// Whether relays on this protocol forward single requests
    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }

    /// Scheme string
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(RelayError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Parsed `scheme://host:port?query` target
///
/// Immutable once parsed. `port` is `None` only for tcp/udp endpoints written
/// without one; relays reject those at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    proxy_names: Vec<String>,
    load_balance: bool,
    weight: u32,
}

impl Endpoint {
    /// Parse endpoint text
    ///
    /// # Errors
    ///
    /// Returns an error for malformed URLs, unknown schemes, a missing host
    /// or an `lb_weight` that is not a positive integer.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| RelayError::InvalidEndpoint {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(text.trim()).map_err(|e| invalid(&e.to_string()))?;
        let protocol: Protocol = url.scheme().parse()?;

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(invalid("missing host")),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = url.port().or_else(|| protocol.default_port());

        let mut proxy_names = Vec::new();
        let mut load_balance = true;
        let mut weight = defaults::LOAD_BALANCE_WEIGHT;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "proxy" => {
                    proxy_names.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .map(str::to_string),
                    );
                }
                "lb" => {
                    let value = value.to_lowercase();
                    load_balance = !LB_DISABLED_VALUES.contains(&value.as_str());
                }
                "lb_weight" => {
                    weight = match value.trim().parse::<u32>() {
                        Ok(w) if w > 0 => w,
                        _ => return Err(RelayError::InvalidWeight(value.to_string())),
                    };
                }
                _ => {}
            }
        }

        Ok(Self {
            protocol,
            host,
            port,
            proxy_names,
            load_balance,
            weight,
        })
    }

    /// Protocol taken from the scheme
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Host name or IP literal (IPv6 without brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, explicit or implied by the scheme
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Named proxies to dial through, in order; empty means direct
    pub fn proxy_names(&self) -> &[String] {
        &self.proxy_names
    }

    /// Whether this destination takes part in load balancing
    pub fn load_balance_enabled(&self) -> bool {
        self.load_balance
    }

    /// Weight used by the weighted-random draw
    pub fn load_balance_weight(&self) -> u32 {
        self.weight
    }

    /// `host:port` suitable for dialing, if a port is known
    pub fn address(&self) -> Option<String> {
        let port = self.port?;
        Some(if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        })
    }

    /// `host:port`, failing with [`RelayError::MissingPort`]
    pub fn require_address(&self) -> Result<String> {
        self.address()
            .ok_or_else(|| RelayError::MissingPort(self.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        // Encoded the same way `query_pairs` decodes it
        let mut query = form_urlencoded::Serializer::new(String::new());
        let mut has_query = false;
        if !self.proxy_names.is_empty() {
            query.append_pair("proxy", &self.proxy_names.join(","));
            has_query = true;
        }
        if !self.load_balance {
            query.append_pair("lb", "false");
            has_query = true;
        }
        if self.weight != defaults::LOAD_BALANCE_WEIGHT {
            query.append_pair("lb_weight", &self.weight.to_string());
            has_query = true;
        }
        if has_query {
            write!(f, "?{}", query.finish())?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
