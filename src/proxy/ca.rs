//! Tenant certificate authority.
//!
//! Each tenant gets one self-signed ECDSA P-256 CA, persisted in the secret
//! store under `<tenant>/cert` and `<tenant>/key` and memoized here for 24
//! hours. Rotation is driven entirely by the read path: a missing,
//! unparsable, expired, or near-expiry pair is regenerated and written back
//! on the next fetch. Per-host leaf certificates for TLS termination are
//! minted on demand from the loaded CA.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs as provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::error::ProxyError;
use crate::store::{SecretStore, StoreError};

// ── Constants ───────────────────────────────────────────────────────

/// Memory TTL for the tenant CA pair; the stored pair stays valid for the
/// full certificate lifetime.
const CERT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// CA lifetime (~10 years).
const CERT_LIFETIME_DAYS: i64 = 3650;

/// Rotate when less than this remains. Must exceed the longest sandbox
/// runtime plus the memory TTL so a running sandbox never holds a
/// soon-to-expire CA.
const CERT_ROTATE_THRESHOLD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Subject CN on every tenant CA.
const CA_COMMON_NAME: &str = "e2b.dev";

/// Maximum cached leaf certificates. When full, clear all and regenerate on
/// demand.
const MAX_LEAF_CACHE_SIZE: usize = 1000;

/// Leaf certificate validity.
const LEAF_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

// ── CA factory ──────────────────────────────────────────────────────

/// Generate a self-signed ECDSA P-256 CA valid for `ttl_days`, returned as a
/// PEM pair. NotBefore is backdated one hour for clock skew.
pub fn generate_root_ca(ttl_days: i64, common_name: &str) -> Result<(String, String), ProxyError> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| ProxyError::Crypto(format!("generate CA key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let mut serial = [0u8; 16];
    rand::thread_rng().fill(&mut serial[..]);
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(ttl_days);

    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::Crypto(format!("self-sign CA: {e}")))?;

    Ok((cert.pem(), key.serialize_pem()))
}

/// Returns true if the certificate cannot be parsed, is expired, or expires
/// within the rotate threshold.
fn should_rotate(cert_pem: &str) -> bool {
    let pem = match x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()) {
        Ok((_, pem)) if pem.label == "CERTIFICATE" => pem,
        _ => return true,
    };
    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(_) => return true,
    };

    let not_after = cert.validity().not_after.timestamp();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    if not_after <= now {
        return true;
    }
    not_after - now < CERT_ROTATE_THRESHOLD.as_secs() as i64
}

// ── Store-backed certificate cache ──────────────────────────────────

/// A tenant's CA material as stored: PEM pair.
#[derive(Clone, Debug)]
pub struct TenantCa {
    pub cert_pem: String,
    pub key_pem: String,
}

pub struct CertificateCache {
    cache: TtlCache<TenantCa>,
    store: Arc<dyn SecretStore>,
}

impl CertificateCache {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            cache: TtlCache::new(CERT_CACHE_TTL),
            store,
        }
    }

    /// Fetch the tenant CA, generating and persisting one when the store has
    /// no usable pair. Backend failures surface without triggering rotation.
    pub async fn get_certificate(&self, tenant: &str) -> Result<TenantCa, ProxyError> {
        if let Some(ca) = self.cache.get(tenant) {
            return Ok(ca);
        }

        let cert_res = self.store.get(&format!("{tenant}/cert")).await;
        let key_res = self.store.get(&format!("{tenant}/key")).await;

        let (cert_pem, key_pem) = match (cert_res, key_res) {
            (Err(StoreError::Backend(c)), Err(StoreError::Backend(k))) => {
                return Err(StoreError::Backend(format!(
                    "fetch CA pair for {tenant}: cert: {c}; key: {k}"
                ))
                .into());
            }
            (Err(StoreError::Backend(c)), _) => {
                return Err(
                    StoreError::Backend(format!("fetch CA pair for {tenant}: cert: {c}")).into(),
                );
            }
            (_, Err(StoreError::Backend(k))) => {
                return Err(
                    StoreError::Backend(format!("fetch CA pair for {tenant}: key: {k}")).into(),
                );
            }
            (Err(StoreError::NotFound(_)), _) | (_, Err(StoreError::NotFound(_))) => {
                return self.generate_and_store(tenant).await;
            }
            (Ok(cert), Ok(key)) => (cert.value, key.value),
        };

        if should_rotate(&cert_pem) {
            info!(tenant, "tenant CA near expiry or unparsable, rotating");
            return self.generate_and_store(tenant).await;
        }

        let ca = TenantCa { cert_pem, key_pem };
        self.cache.insert(tenant, ca.clone());
        Ok(ca)
    }

    /// Generate a fresh CA and write cert then key. A partial write leaves an
    /// inconsistent pair in the store; the next read regenerates it.
    async fn generate_and_store(&self, tenant: &str) -> Result<TenantCa, ProxyError> {
        let (cert_pem, key_pem) = generate_root_ca(CERT_LIFETIME_DAYS, CA_COMMON_NAME)?;

        self.store
            .put(&format!("{tenant}/cert"), &cert_pem, None)
            .await?;
        self.store
            .put(&format!("{tenant}/key"), &key_pem, None)
            .await?;

        info!(tenant, "generated and stored new tenant CA");

        let ca = TenantCa { cert_pem, key_pem };
        self.cache.insert(tenant, ca.clone());
        Ok(ca)
    }
}

// ── Leaf signer ─────────────────────────────────────────────────────

/// Mints per-host leaf certificates signed by the tenant CA, for TLS
/// termination toward the client. Leaves are cached with clear-all eviction.
pub struct LeafSigner {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl LeafSigner {
    /// Load the tenant CA PEM pair into signing form. The chain served to
    /// clients carries the stored CA bytes, not a re-signed copy.
    pub fn from_pem(ca: &TenantCa) -> Result<Self, ProxyError> {
        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| ProxyError::Crypto(format!("parse CA key: {e}")))?;

        let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem)
            .map_err(|e| ProxyError::Crypto(format!("parse CA cert: {e}")))?;

        // Re-signing yields the Certificate value rcgen needs as an issuer;
        // the resulting signature is never served.
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::Crypto(format!("load CA cert: {e}")))?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(ca.cert_pem.as_bytes())
            .map_err(|e| ProxyError::Crypto(format!("decode CA pem: {e:?}")))?;
        let ca_der = CertificateDer::from(pem.contents);

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            cache: DashMap::new(),
        })
    }

    /// Get or mint a leaf certificate for `host`, ready for rustls.
    pub fn certified_key_for(&self, host: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        if let Some(entry) = self.cache.get(host) {
            return Ok(Arc::clone(entry.value()));
        }

        let certified = Arc::new(self.mint_leaf(host)?);

        if self.cache.len() >= MAX_LEAF_CACHE_SIZE {
            self.cache.clear();
            warn!(max = MAX_LEAF_CACHE_SIZE, "leaf cache full, cleared");
        }
        self.cache.insert(host.to_owned(), Arc::clone(&certified));
        debug!(host, "minted leaf certificate");
        Ok(certified)
    }

    fn mint_leaf(&self, host: &str) -> Result<CertifiedKey, ProxyError> {
        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Crypto(format!("generate leaf key: {e}")))?;

        let mut params = CertificateParams::new(vec![host.to_owned()])
            .map_err(|e| ProxyError::Crypto(format!("leaf params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + time::Duration::seconds(LEAF_VALIDITY.as_secs() as i64);

        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::Crypto(format!("sign leaf cert: {e}")))?;

        let chain = vec![
            CertificateDer::from(leaf_cert.der().to_vec()),
            self.ca_der.clone(),
        ];

        let key_der =
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der().to_vec()));
        let signing_key = provider::default_provider()
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| ProxyError::Crypto(format!("load leaf key: {e}")))?;

        Ok(CertifiedKey::new(chain, signing_key))
    }
}
