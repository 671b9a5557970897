use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, SanType, SerialNumber,
};
use tracing::{info, warn};

use crate::error::ControlPlaneError;

const LEAF_VALIDITY_DAYS: i64 = 30;
const LEAF_REFRESH_SKEW_DAYS: i64 = 2;

#[derive(Clone)]
pub struct LeafCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints short-lived leaf certificates for intercepted hosts, signed by one
/// CA per sidecar process. The CA key never leaves this process.
pub struct CertAuthority {
    ca_cert_pem: String,
    ca_key_pem: String,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cache: DashMap<String, LeafCertificate>,
}

impl CertAuthority {
    /// Loads an existing CA from PEM files, or generates an ephemeral one
    /// if the files are absent, logging that credential injection will not
    /// federate beyond this process' lifetime in that case.
    pub fn load_or_generate(cert_path: Option<&str>, key_path: Option<&str>) -> anyhow::Result<Self> {
        match (cert_path, key_path) {
            (Some(cp), Some(kp)) if std::path::Path::new(cp).exists() && std::path::Path::new(kp).exists() => {
                let cert_pem = std::fs::read_to_string(cp)?;
                let key_pem = std::fs::read_to_string(kp)?;
                Self::from_pem(cert_pem, key_pem)
            }
            _ => {
                warn!("ca_files_absent_generating_ephemeral_ca");
                Self::generate()
            }
        }
    }

    fn from_pem(cert_pem: String, key_pem: String) -> anyhow::Result<Self> {
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let cert = params.self_signed(&key_pair)?;
        Ok(CertAuthority {
            ca_cert_pem: cert_pem,
            ca_key_pem: key_pem,
            ca_cert: cert,
            ca_key: key_pair,
            cache: DashMap::new(),
        })
    }

    pub fn generate() -> anyhow::Result<Self> {
        let mut params = CertificateParams::new(Vec::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "sandboxd egress proxy CA");
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(CertAuthority {
            ca_cert_pem: cert.pem(),
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert: cert,
            ca_key: key_pair,
            cache: DashMap::new(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Returns a cached leaf for `host` if present and not within
    /// `LEAF_REFRESH_SKEW_DAYS` of expiry, otherwise mints a fresh one.
    pub fn get_or_create_leaf(&self, host: &str) -> Result<LeafCertificate, ControlPlaneError> {
        if let Some(existing) = self.cache.get(host) {
            if existing.expires_at - Duration::days(LEAF_REFRESH_SKEW_DAYS) > Utc::now() {
                return Ok(existing.clone());
            }
        }

        let leaf = self.mint_leaf(host)?;
        self.cache.insert(host.to_string(), leaf.clone());
        info!(host, "leaf_certificate_minted");
        Ok(leaf)
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCertificate, ControlPlaneError> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ControlPlaneError::Fatal(format!("invalid SAN for {host}: {e}")))?;

        let san = if host.parse::<std::net::IpAddr>().is_ok() {
            SanType::IpAddress(host.parse().unwrap())
        } else {
            SanType::DnsName(
                host.to_string()
                    .try_into()
                    .map_err(|e| ControlPlaneError::Fatal(format!("invalid dns name {host}: {e}")))?,
            )
        };
        params.subject_alt_names = vec![san];
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut serial_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial_bytes);
        params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
            .map_err(|e| ControlPlaneError::Fatal(format!("leaf key generation failed: {e}")))?;

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| ControlPlaneError::Fatal(format!("leaf signing failed: {e}")))?;

        Ok(LeafCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            expires_at: Utc::now() + Duration::days(LEAF_VALIDITY_DAYS),
        })
    }
}

pub type SharedCertAuthority = Arc<CertAuthority>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_loadable_ca() {
        let ca = CertAuthority::generate().unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn get_or_create_leaf_caches_by_host() {
        let ca = CertAuthority::generate().unwrap();
        let first = ca.get_or_create_leaf("example.com").unwrap();
        let second = ca.get_or_create_leaf("example.com").unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn get_or_create_leaf_differs_per_host() {
        let ca = CertAuthority::generate().unwrap();
        let a = ca.get_or_create_leaf("a.example.com").unwrap();
        let b = ca.get_or_create_leaf("b.example.com").unwrap();
        assert_ne!(a.cert_pem, b.cert_pem);
    }
}
