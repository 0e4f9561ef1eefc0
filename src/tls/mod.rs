//! TLS handling module
//!
//! Builds the acceptor HTTPS relays use to terminate TLS.

mod acceptor;
mod cert;

pub use acceptor::create_tls_acceptor;
pub use cert::{cert_subject, load_cert};
