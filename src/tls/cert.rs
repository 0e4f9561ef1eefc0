//! Certificate helpers

use openssl::nid::Nid;
use openssl::x509::X509;
use std::path::Path;

use crate::common::Result;

/// Load the first PEM certificate from a file
pub fn load_cert(cert_path: &Path) -> Result<X509> {
    let pem = std::fs::read(cert_path)?;
    Ok(X509::from_pem(&pem)?)
}

/// Common name of a certificate's subject, or `unknown`
pub fn cert_subject(cert: &X509) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| format!("CN={}", cn))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use std::path::PathBuf;

    /// Write a self-signed certificate and key into `dir`
    pub(crate) fn write_self_signed(dir: &Path, common_name: &str) -> (PathBuf, PathBuf) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
        let name = name.build();

        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
        std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_load_and_subject() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = write_self_signed(dir.path(), "relay.test");

        let cert = load_cert(&cert_path).unwrap();
        assert_eq!(cert_subject(&cert), "CN=relay.test");
    }

    #[test]
    fn test_load_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.crt");
        std::fs::write(&path, b"not a certificate").unwrap();
        assert!(load_cert(&path).is_err());
    }
}
