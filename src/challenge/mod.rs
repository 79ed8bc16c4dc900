use crate::error::ChallengeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub mod alpn;
pub mod forge;
pub mod http;

pub use alpn::{AlpnChallengeInstaller, AlpnChallengeResponder};
pub use forge::{AlpnCertificateForge, ForgedCertificate};
pub use http::HttpChallengeResponder;

/// ALPN protocol identifier negotiated by TLS-ALPN-01 validation connections.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl Display for ChallengeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provisions proofs of control for an ACME authorization.
///
/// `offer` must make the proof observable to the CA before it returns. `withdraw` is called for
/// every offered challenge once the order settled, whatever its outcome, and is a no-op for
/// unknown tokens.
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    fn challenge_type(&self) -> ChallengeType;

    async fn offer(
        &self,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError>;

    async fn withdraw(&self, identifier: &str, token: &str) -> Result<(), ChallengeError>;
}
