use crate::crypto::keys::{KeyType, new_key};
use crate::crypto::sha256;
use crate::error::ForgeryError;
use anyhow::Context;
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa, KeyUsagePurpose,
    SerialNumber,
};
use time::{Duration, OffsetDateTime};

const OID_EXTENDED_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
/// `SEQUENCE { id-kp-serverAuth }`
const EXTENDED_KEY_USAGE_SERVER_AUTH: &[u8] = &[
    0x30, 0x0a, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x01,
];
const VALIDITY_BACKDATE: Duration = Duration::minutes(5);
const VALIDITY_PERIOD: Duration = Duration::days(7);

/// A self-signed TLS-ALPN-01 validation certificate and its private key.
#[derive(Clone)]
pub struct ForgedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for ForgedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgedCertificate")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// Builds the certificates presented to the CA during TLS-ALPN-01 validation (RFC 8737).
#[derive(Debug, Default, Clone, Copy)]
pub struct AlpnCertificateForge;

impl AlpnCertificateForge {
    /// Forges a certificate for `domain` that carries `SHA-256(key_authorization)` in the
    /// critical acmeIdentifier extension. Every call uses a fresh RSA-2048 key.
    pub fn build(
        &self,
        domain: &str,
        key_authorization: &str,
    ) -> Result<ForgedCertificate, ForgeryError> {
        forge(domain, key_authorization).map_err(|source| ForgeryError {
            domain: domain.to_string(),
            source,
        })
    }
}

fn forge(domain: &str, key_authorization: &str) -> anyhow::Result<ForgedCertificate> {
    let key = new_key(KeyType::Rsa2048)?;

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .context("Invalid domain for validation certificate")?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, domain);
    params.distinguished_name = distinguished_name;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    // rcgen always marks its own EKU extension non-critical
    let mut extended_key_usage =
        CustomExtension::from_oid_content(OID_EXTENDED_KEY_USAGE, EXTENDED_KEY_USAGE_SERVER_AUTH.to_vec());
    extended_key_usage.set_criticality(true);
    let digest = sha256(key_authorization.as_bytes());
    params.custom_extensions = vec![
        extended_key_usage,
        CustomExtension::new_acme_identifier(&digest),
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - VALIDITY_BACKDATE;
    params.not_after = now + VALIDITY_PERIOD;
    let mut serial: [u8; 16] = rand::random();
    // Keep the DER INTEGER positive
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let certificate = params
        .self_signed(&key)
        .context("Signing validation certificate failed")?;
    Ok(ForgedCertificate {
        cert_pem: certificate.pem(),
        key_pem: key.serialize_pem(),
    })
}
