//! TLS acceptor creation for HTTPS relays

use log::{debug, info};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use std::path::Path;

use super::cert::{cert_subject, load_cert};
use crate::common::{RelayError, Result};

/// Create a TLS acceptor from a PEM certificate chain and private key
///
/// Clients are not asked for certificates; the relay only terminates TLS.
///
/// # Example
///
/// ```no_run
/// # use std::path::Path;
/// # use localrelay::tls::create_tls_acceptor;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let acceptor = create_tls_acceptor(
///     Path::new("certs/server.crt"),
///     Path::new("certs/server.key"),
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<SslAcceptor> {
    for path in [cert_path, key_path] {
        if !path.is_file() {
            return Err(RelayError::Config(format!(
                "TLS file not found: {}",
                path.display()
            )));
        }
    }

    let cert = load_cert(cert_path)?;
    info!("Serving TLS certificate {}", cert_subject(&cert));

    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    acceptor.set_certificate_chain_file(cert_path)?;
    acceptor.set_private_key_file(key_path, SslFiletype::PEM)?;
    acceptor.check_private_key()?;

    acceptor.set_verify(SslVerifyMode::NONE);
    debug!("TLS acceptor ready for {}", cert_path.display());

    Ok(acceptor.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cert::tests::write_self_signed;

    #[test]
    fn test_create_acceptor() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "localhost");

        assert!(create_tls_acceptor(&cert, &key).is_ok());
    }

    #[test]
    fn test_missing_files() {
        let err = create_tls_acceptor(Path::new("/nonexistent.crt"), Path::new("/nonexistent.key"))
            .err().unwrap();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_mismatched_key() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        let (cert, _) = write_self_signed(&a, "one");
        let (_, key) = write_self_signed(&b, "two");

        assert!(create_tls_acceptor(&cert, &key).is_err());
    }
}
