use std::collections::HashMap;
use std::fs;

use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::config::Settings;
use crate::error::{KmeError, Result};

/// The logical party behind one configured certificate: a locally-attached
/// SAE, the shared KME of an adjacent hop link, or a neighboring trusted
/// node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Sae(String),
    Kme(String),
    TrustedNode(String),
}

type CertFingerprint = (String, String);

fn cert_fingerprint(path: &str) -> Result<CertFingerprint> {
    let raw = fs::read(path).map_err(|e| {
        KmeError::Fatal(format!("could not read certificate {}: {}", path, e))
    })?;

    let (_, pem) = parse_x509_pem(&raw)
        .map_err(|e| KmeError::Fatal(format!("could not parse PEM {}: {}", path, e)))?;

    fingerprint_from_der(&pem.contents)
        .map_err(|e| KmeError::Fatal(format!("could not parse certificate {}: {}", path, e)))
}

/// Extracts a (CN, serial) fingerprint from a raw DER certificate, as
/// handed to the gateway by the TLS layer for a live peer connection.
pub fn fingerprint_from_der(der: &[u8]) -> Result<CertFingerprint> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|e| KmeError::Identity(format!("could not parse peer certificate: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();

    let serial = cert.tbs_certificate.raw_serial_as_string();

    Ok((common_name, serial))
}

/// Bidirectional (CN, serial) -> identity map, built once at startup from
/// every certificate named in `settings.json`.
///
/// A `kme_cert` is the certificate the remote end of an attached-KME link
/// presents when it calls *into* this process southbound; `sae_cert`/
/// `sae_key` are the credentials this process presents when calling *out*.
/// A trusted-node link authenticates in both directions with the one
/// configured `cert`/`key` pair. Recognizing the caller is a fingerprint
/// lookup, not a certificate-chain walk: the gateway's TLS layer already
/// verified the chain against `ca_file` before the request reaches here.
pub struct IdentityStore {
    entries: HashMap<CertFingerprint, Identity>,
}

impl IdentityStore {
    pub fn load(settings: &Settings) -> Result<Self> {
        let mut entries = HashMap::new();

        for sae in &settings.attached_saes {
            let fingerprint = cert_fingerprint(&sae.sae_cert)?;
            entries.insert(fingerprint, Identity::Sae(sae.sae_id.clone()));
        }

        for kme in &settings.attached_kmes {
            let fingerprint = cert_fingerprint(&kme.kme_cert)?;
            entries.insert(fingerprint, Identity::Kme(kme.kme_id.clone()));
        }

        for tn in &settings.attached_trusted_nodes {
            let fingerprint = cert_fingerprint(&tn.cert)?;
            entries.insert(fingerprint, Identity::TrustedNode(tn.id.clone()));
        }

        Ok(Self { entries })
    }

    pub fn resolve(&self, common_name: &str, serial: &str) -> Result<&Identity> {
        self.entries
            .get(&(common_name.to_string(), serial.to_string()))
            .ok_or_else(|| {
                KmeError::Identity(format!(
                    "no configured party matches certificate CN={} serial={}",
                    common_name, serial
                ))
            })
    }

    pub fn expect_sae(&self, common_name: &str, serial: &str) -> Result<String> {
        match self.resolve(common_name, serial)? {
            Identity::Sae(sae_id) => Ok(sae_id.clone()),
            _ => Err(KmeError::Identity(
                "caller is not a recognized SAE".to_string(),
            )),
        }
    }

    pub fn expect_trusted_node(&self, common_name: &str, serial: &str) -> Result<String> {
        match self.resolve(common_name, serial)? {
            Identity::TrustedNode(tn_id) => Ok(tn_id.clone()),
            _ => Err(KmeError::Identity(
                "caller is not a recognized trusted node".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_reports_identity_error_when_unrecognized() {
        let store = IdentityStore {
            entries: HashMap::new(),
        };

        let result = store.resolve("unknown-cn", "1234");
        assert!(matches!(result, Err(KmeError::Identity(_))));
    }

    #[test]
    fn expect_sae_rejects_a_kme_identity() {
        let mut entries = HashMap::new();
        entries.insert(
            ("kme-a".to_string(), "1".to_string()),
            Identity::Kme("kme-a".to_string()),
        );
        let store = IdentityStore { entries };

        assert!(matches!(
            store.expect_sae("kme-a", "1"),
            Err(KmeError::Identity(_))
        ));
    }

    #[test]
    fn expect_trusted_node_matches_on_exact_fingerprint() {
        let mut entries = HashMap::new();
        entries.insert(
            ("tn-b".to_string(), "42".to_string()),
            Identity::TrustedNode("tn-b".to_string()),
        );
        let store = IdentityStore { entries };

        assert_eq!(store.expect_trusted_node("tn-b", "42").unwrap(), "tn-b");
        assert!(store.expect_trusted_node("tn-b", "99").is_err());
    }
}
