//! Error handling module
//!
//! This module defines the error types and result type aliases used by the relay engine.

use std::io;
use thiserror::Error;

/// Relay engine error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS handshake error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Endpoint text could not be parsed
    #[error("Invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint {
        /// Text that failed to parse
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// `lb_weight` was not a positive integer
    #[error("Invalid load balance weight {0:?}: must be a positive integer")]
    InvalidWeight(String),

    /// Endpoint scheme is not tcp, udp, http or https
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A proxy descriptor uses something other than SOCKS5
    #[error("Proxy {name:?} uses unsupported protocol {protocol:?} (only socks5 is supported)")]
    UnsupportedProxyProtocol {
        /// Proxy name
        name: String,
        /// Configured protocol
        protocol: String,
    },

    /// A destination references a proxy the registry does not know
    #[error("Proxy {name:?} referenced but not defined (attempted {attempted:?})")]
    ProxyNotDefined {
        /// The name that failed to resolve
        name: String,
        /// Names resolved before the failure
        resolved: Vec<String>,
        /// Every name that was requested
        attempted: Vec<String>,
    },

    /// HTTP(S) relays accept exactly one destination
    #[error("Too many destinations for this relay type")]
    TooManyDestinations,

    /// A relay needs at least one destination
    #[error("At least one destination must be set")]
    NoDestination,

    /// Relay name does not match the identifier pattern
    #[error("Invalid relay name {0:?}")]
    InvalidName(String),

    /// A tcp/udp endpoint has no port
    #[error("Endpoint {0} has no port")]
    MissingPort(String),

    /// Dialing a destination failed
    #[error("Failed to dial {0}")]
    DialFailed(String),

    /// Dialing a destination timed out
    #[error("Dial to {0} timed out")]
    DialTimeout(String),

    /// SOCKS5 negotiation failed
    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    /// Forwarding an HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Relay has no open listener
    #[error("Relay is not running")]
    NotRunning,

    /// Relay already owns a listener
    #[error("Relay is already running")]
    AlreadyRunning,

    /// No relay with this name is managed
    #[error("Unknown relay {0:?}")]
    UnknownRelay(String),
}

impl RelayError {
    /// Returns true when the error only signals that a peer went away
    ///
    /// End-of-stream, reset and already-closed sockets are the normal end of a
    /// relayed session and are not reported as failures.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Self::Io(e) => is_clean_close_kind(e.kind()),
            _ => false,
        }
    }
}

/// Classify an I/O error kind as a peer-initiated close
pub fn is_clean_close_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `RelayError`.
pub type Result<T> = std::result::Result<T, RelayError>;
