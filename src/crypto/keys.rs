use anyhow::{Context, anyhow};
use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::rsa;
use pem::Pem;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Private key algorithm used for the node's certificate key.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString)]
pub enum KeyType {
    #[default]
    #[serde(rename = "rsa-2048")]
    #[strum(serialize = "rsa-2048")]
    Rsa2048,
    #[serde(rename = "rsa-3072")]
    #[strum(serialize = "rsa-3072")]
    Rsa3072,
    #[serde(rename = "rsa-4096")]
    #[strum(serialize = "rsa-4096")]
    Rsa4096,
    #[serde(rename = "ecdsa-p256")]
    #[strum(serialize = "ecdsa-p256")]
    EcdsaP256,
    #[serde(rename = "ecdsa-p384")]
    #[strum(serialize = "ecdsa-p384")]
    EcdsaP384,
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Rsa2048 => write!(f, "RSA-2048"),
            KeyType::Rsa3072 => write!(f, "RSA-3072"),
            KeyType::Rsa4096 => write!(f, "RSA-4096"),
            KeyType::EcdsaP256 => write!(f, "ECDSA with P-256"),
            KeyType::EcdsaP384 => write!(f, "ECDSA with P-384"),
        }
    }
}

/// Generates a fresh private key of the requested type.
pub fn new_key(typ: KeyType) -> anyhow::Result<rcgen::KeyPair> {
    match typ {
        KeyType::Rsa2048 => new_rsa_key(rsa::KeySize::Rsa2048),
        KeyType::Rsa3072 => new_rsa_key(rsa::KeySize::Rsa3072),
        KeyType::Rsa4096 => new_rsa_key(rsa::KeySize::Rsa4096),
        KeyType::EcdsaP256 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("Could not generate key"),
        KeyType::EcdsaP384 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .context("Could not generate key"),
    }
}

fn new_rsa_key(size: rsa::KeySize) -> anyhow::Result<rcgen::KeyPair> {
    // rcgen cannot generate RSA keys by itself, so let aws-lc-rs do it and hand over PKCS#8
    let keypair = rsa::KeyPair::generate(size).map_err(|_| anyhow!("Could not generate key"))?;
    let pkcs8 = keypair
        .as_der()
        .map_err(|_| anyhow!("Serializing RSA keypair failed"))?;
    let pem = Pem::new("PRIVATE KEY", pkcs8.as_ref());
    key_from_pem(&pem::encode(&pem))
}

/// Parses a PEM private key. PKCS#1, PKCS#8 and SEC1 are all accepted.
pub fn key_from_pem(pem: &str) -> anyhow::Result<rcgen::KeyPair> {
    rcgen::KeyPair::from_pem(pem).context("reading private key from pem failed")
}
