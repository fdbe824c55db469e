//! Root CA bootstrap and on-demand leaf certificate signing using rcgen.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, SanType, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::pem::{self, PemObject, SectionKind};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use sha1::{Digest, Sha1};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

/// Lifetime of a signed leaf certificate.
pub const LEAF_VALIDITY: Duration = Duration::hours(24);
/// How far a leaf's NotBefore is backdated to absorb client clock skew.
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::minutes(10);
/// A cached leaf this close to expiry is re-signed instead of reused.
pub const RENEWAL_MARGIN: Duration = Duration::minutes(10);

const ROOT_VALIDITY_YEARS: i32 = 2;
const SERIAL_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to decode PEM: {0}")]
    Pem(#[from] pem::Error),
    #[error("CA material must include a CERTIFICATE and an RSA PRIVATE KEY block")]
    MissingMaterial,
    #[error("invalid CA certificate: {0}")]
    InvalidCertificate(#[source] rcgen::Error),
    #[error("invalid RSA private key: {0}")]
    InvalidKey(String),
    #[error("failed to generate or sign certificate: {0}")]
    Signing(#[from] rcgen::Error),
    #[error("failed to encode private key: {0}")]
    KeyEncoding(String),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("no server name and no address to certify")]
    MissingSubject,
    #[error("failed to write CA material: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate authority that signs short-lived leaf certificates on demand.
///
/// The root key never leaves this type; callers only receive the signed
/// leaf bundles, which are cached per subject until they approach expiry.
pub struct CertificateAuthority {
    /// The root certificate in DER format.
    certificate_der: CertificateDer<'static>,
    /// Root certificate parameters together with the root key.
    issuer: Issuer<'static, KeyPair>,
    /// Signed leaves keyed by subject name.
    cache: RwLock<HashMap<String, CachedLeaf>>,
    clock: Arc<dyn Clock>,
}

struct CachedLeaf {
    key: Arc<CertifiedKey>,
    not_after: OffsetDateTime,
}

impl CachedLeaf {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now + RENEWAL_MARGIN < self.not_after
    }
}

/// What a leaf certificate is issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    Dns(String),
    Ip(IpAddr),
}

impl Subject {
    /// A textual IP in `name` becomes an IP subject; an empty name falls
    /// back to the connection address.
    fn resolve(name: &str, addr: Option<IpAddr>) -> CaResult<Self> {
        if name.is_empty() {
            return addr.map(Subject::Ip).ok_or(CaError::MissingSubject);
        }
        Ok(match name.parse::<IpAddr>() {
            Ok(ip) => Subject::Ip(ip),
            Err(_) => Subject::Dns(name.to_ascii_lowercase()),
        })
    }

    fn cache_key(&self) -> String {
        self.to_string()
    }

    fn san(&self) -> CaResult<SanType> {
        match self {
            Subject::Dns(name) => Ok(SanType::DnsName(
                name.as_str()
                    .try_into()
                    .map_err(|_| CaError::InvalidDnsName(name.clone()))?,
            )),
            Subject::Ip(ip) => Ok(SanType::IpAddress(*ip)),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Dns(name) => f.write_str(name),
            Subject::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl CertificateAuthority {
    /// Loads the authority from concatenated PEM blocks using the system clock.
    ///
    /// The first `CERTIFICATE` and the first `RSA PRIVATE KEY` block are
    /// used, in any order; other block types are ignored.
    pub fn load(pem: &[u8]) -> CaResult<Self> {
        Self::with_clock(pem, Arc::new(SystemClock))
    }

    /// Loads the authority with an explicit time source.
    pub fn with_clock(pem: &[u8], clock: Arc<dyn Clock>) -> CaResult<Self> {
        let mut certificate = None;
        let mut key = None;

        for section in <(SectionKind, Vec<u8>)>::pem_slice_iter(pem) {
            let (kind, der) = section?;
            match kind {
                SectionKind::Certificate if certificate.is_none() => {
                    certificate = Some(CertificateDer::from(der));
                }
                SectionKind::RsaPrivateKey if key.is_none() => {
                    key = Some(key_pair_from_pkcs1(&der)?);
                }
                _ => {}
            }
        }

        let (Some(certificate_der), Some(key)) = (certificate, key) else {
            return Err(CaError::MissingMaterial);
        };
        let issuer =
            Issuer::from_ca_cert_der(&certificate_der, key).map_err(CaError::InvalidCertificate)?;

        debug!("loaded CA certificate ({} bytes)", certificate_der.len());

        Ok(Self {
            certificate_der,
            issuer,
            cache: RwLock::new(HashMap::new()),
            clock,
        })
    }

    /// Returns the root certificate in DER format.
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    /// Number of leaves currently held in the cache, fresh or not.
    pub fn cached_leaves(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns a certificate for `name`, signing a new one when no cached
    /// leaf has more than [`RENEWAL_MARGIN`] of validity left.
    ///
    /// When `name` is empty the certificate is issued for `addr` instead.
    pub fn sign(&self, name: &str, addr: Option<IpAddr>) -> CaResult<Arc<CertifiedKey>> {
        let subject = Subject::resolve(name, addr)?;
        let cache_key = subject.cache_key();

        if let Some(key) = self.cached(&cache_key) {
            debug!("using cached leaf certificate for {}", subject);
            return Ok(key);
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have signed while we waited for the write lock.
        let now = self.clock.now();
        if let Some(entry) = cache.get(&cache_key)
            && entry.is_fresh(now)
        {
            return Ok(Arc::clone(&entry.key));
        }

        let leaf = self.issue(&subject, now)?;
        let key = Arc::clone(&leaf.key);
        cache.insert(cache_key, leaf);

        Ok(key)
    }

    fn cached(&self, cache_key: &str) -> Option<Arc<CertifiedKey>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(cache_key)?;
        entry
            .is_fresh(self.clock.now())
            .then(|| Arc::clone(&entry.key))
    }

    fn issue(&self, subject: &Subject, now: OffsetDateTime) -> CaResult<CachedLeaf> {
        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;

        let mut dn = DistinguishedName::new();
        if let Subject::Dns(name) = subject {
            dn.push(DnType::CommonName, name.as_str());
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject.san()?];
        params.serial_number = Some(random_serial());
        params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key_pair)?);
        params.use_authority_key_identifier_extension = true;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = now - CLOCK_SKEW_ALLOWANCE;
        params.not_after = now + LEAF_VALIDITY;

        let cert = params.signed_by(&key_pair, &self.issuer)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = any_supported_type(&key_der).map_err(CaError::SigningKey)?;

        debug!("signed leaf certificate for {}", subject);

        Ok(CachedLeaf {
            key: Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key)),
            not_after: params.not_after,
        })
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_leaves", &self.cached_leaves())
            .finish_non_exhaustive()
    }
}

/// Generates a new root CA and writes it to `writer` as a `CERTIFICATE`
/// block followed by an `RSA PRIVATE KEY` block.
pub fn generate<W: Write>(mut writer: W, common_name: &str) -> CaResult<()> {
    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let now = SystemClock.now();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial());
    params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key_pair)?);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = now;
    params.not_after = now
        .replace_year(now.year() + ROOT_VALIDITY_YEARS)
        .unwrap_or(now + Duration::days(365 * ROOT_VALIDITY_YEARS as i64 + 1));

    let cert = params.self_signed(&key_pair)?;

    writer.write_all(cert.pem().as_bytes())?;
    writer.write_all(pkcs1_pem(&key_pair)?.as_bytes())?;
    writer.flush()?;

    info!("generated root CA certificate for {}", common_name);

    Ok(())
}

/// Subject key identifier: SHA-1 over the DER `RSAPublicKey`, which is the
/// content of the certificate's `subjectPublicKey` BIT STRING.
fn subject_key_id(key_pair: &KeyPair) -> CaResult<Vec<u8>> {
    let public = rsa_key(key_pair)?
        .to_public_key()
        .to_pkcs1_der()
        .map_err(|e| CaError::KeyEncoding(e.to_string()))?;
    Ok(Sha1::digest(public.as_bytes()).to_vec())
}

/// 20 random bytes with the sign bit cleared so the DER INTEGER stays
/// within 20 octets.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    rand::rng().fill(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn key_pair_from_pkcs1(der: &[u8]) -> CaResult<KeyPair> {
    let key =
        RsaPrivateKey::from_pkcs1_der(der).map_err(|e| CaError::InvalidKey(e.to_string()))?;
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| CaError::InvalidKey(e.to_string()))?;
    KeyPair::try_from(pkcs8.as_bytes()).map_err(|e| CaError::InvalidKey(e.to_string()))
}

fn rsa_key(key_pair: &KeyPair) -> CaResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(&key_pair.serialize_der())
        .map_err(|e| CaError::KeyEncoding(e.to_string()))
}

fn pkcs1_pem(key_pair: &KeyPair) -> CaResult<String> {
    let pem = rsa_key(key_pair)?
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CaError::KeyEncoding(e.to_string()))?;
    Ok(pem.as_str().to_owned())
}
