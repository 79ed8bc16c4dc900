use crate::crypto::keys::key_from_pem;
use crate::error::StoreError;
use anyhow::{Context, Error, anyhow};
use rcgen::CertificateSigningRequest;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::warn;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// Receives every newly published certificate.
pub type CertificateCallback = Arc<dyn Fn(Arc<CertificateMaterial>) + Send + Sync>;

/// A private key together with the certificate chain issued for it.
///
/// Values are never mutated: a renewal produces a new instance which is published as a whole.
/// Construction verifies that the key belongs to the leaf certificate, so a mismatched pair
/// cannot exist.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    private_key_pem: String,
    certificate_chain_pem: String,
    not_after: OffsetDateTime,
}

impl CertificateMaterial {
    pub fn from_pem(
        private_key_pem: String,
        certificate_chain_pem: String,
    ) -> Result<Self, StoreError> {
        let leaf = leaf_certificate(&certificate_chain_pem).map_err(StoreError::Parse)?;
        let key = key_from_pem(&private_key_pem).map_err(StoreError::Parse)?;
        if key.public_key_der() != leaf.subject_public_key_info {
            return Err(StoreError::Inconsistent);
        }
        Ok(Self {
            private_key_pem,
            certificate_chain_pem,
            not_after: leaf.validity.not_after,
        })
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn certificate_chain_pem(&self) -> &str {
        &self.certificate_chain_pem
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn time_to_expiration(&self, now: OffsetDateTime) -> time::Duration {
        self.not_after - now
    }

    pub fn leaf(&self) -> anyhow::Result<ParsedX509Certificate> {
        leaf_certificate(&self.certificate_chain_pem)
    }
}

impl Debug for CertificateMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("private_key_pem", &"<redacted>")
            .field("certificate_chain_pem", &self.certificate_chain_pem)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Builds a CSR with the first hostname as subject CN and every hostname as a SAN.
pub fn create_and_sign_csr(
    cert_key: &rcgen::KeyPair,
    hostnames: &[String],
) -> Result<CertificateSigningRequest, Error> {
    let common_name = hostnames
        .first()
        .ok_or(anyhow!("CSR needs at least one hostname"))?;
    // CAs reject a CN that is not also a SAN, so the CN is repeated there
    let mut cert_params =
        rcgen::CertificateParams::new(hostnames.to_vec()).context("CSR generation failed")?;
    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, common_name.as_str());
    cert_params.distinguished_name = distinguished_name;
    let csr = cert_params
        .serialize_request(cert_key)
        .context("Signing CSR failed")?;
    Ok(csr)
}

/// Parses the first certificate of a PEM chain, which is the leaf.
pub fn leaf_certificate(chain_pem: &str) -> anyhow::Result<ParsedX509Certificate> {
    let pem = Pem::iter_from_buffer(chain_pem.as_bytes())
        .next()
        .ok_or(anyhow!("PEM does not contain any X.509 certificate"))?
        .context("Reading PEM block failed")?;
    ParsedX509Certificate::try_from(pem.contents)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub subject: String,
    pub issuer: String,
    pub validity: Validity,
    pub subject_alternative_names: Vec<String>,
    pub subject_public_key_info: Vec<u8>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let mut subject_alternative_names = Vec::new();
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns_name) => {
                            subject_alternative_names.push((*dns_name).to_string());
                        }
                        unsupported => {
                            warn!("Found unsupported general name {unsupported} in certificate");
                        }
                    }
                }
            }
        }
        Ok(Self {
            subject: cert.subject.to_string(),
            issuer: cert.issuer.to_string(),
            validity: (&cert.validity).into(),
            subject_alternative_names,
            subject_public_key_info: cert.public_key().raw.to_vec(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}
