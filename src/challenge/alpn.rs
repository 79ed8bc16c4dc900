use crate::challenge::{AlpnCertificateForge, ChallengeHandler, ChallengeType};
use crate::error::ChallengeError;
use crate::server::certified_key_from_pem;
use anyhow::Context;
use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Where validation certificates go so the HTTPS server presents them to `acme-tls/1` clients.
pub trait AlpnChallengeInstaller: Send + Sync + Debug {
    fn install(&self, domain: &str, certified_key: Arc<CertifiedKey>);
    fn remove(&self, domain: &str);
}

/// Answers TLS-ALPN-01 challenges through the HTTPS server's own listener.
#[derive(Debug, Clone)]
pub struct AlpnChallengeResponder {
    forge: AlpnCertificateForge,
    installer: Arc<dyn AlpnChallengeInstaller>,
}

impl AlpnChallengeResponder {
    pub fn new(installer: Arc<dyn AlpnChallengeInstaller>) -> Self {
        Self {
            forge: AlpnCertificateForge,
            installer,
        }
    }

    pub async fn offer(&self, domain: &str, key_authorization: &str) -> Result<(), ChallengeError> {
        let forge = self.forge;
        let forge_domain = domain.to_string();
        let key_authorization = key_authorization.to_string();
        // RSA key generation is CPU-bound
        let forged = tokio::task::spawn_blocking(move || forge.build(&forge_domain, &key_authorization))
            .await
            .context("Forging task failed")
            .map_err(ChallengeError::Other)??;
        let certified_key = certified_key_from_pem(&forged.cert_pem, &forged.key_pem)
            .map_err(ChallengeError::Other)?;
        self.installer.install(domain, Arc::new(certified_key));
        debug!(domain, "Installed TLS-ALPN-01 validation certificate");
        Ok(())
    }

    pub fn withdraw(&self, domain: &str) {
        self.installer.remove(domain);
        debug!(domain, "Removed TLS-ALPN-01 validation certificate");
    }
}

#[async_trait]
impl ChallengeHandler for AlpnChallengeResponder {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::TlsAlpn01
    }

    async fn offer(
        &self,
        identifier: &str,
        _token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError> {
        AlpnChallengeResponder::offer(self, identifier, key_authorization).await
    }

    async fn withdraw(&self, identifier: &str, _token: &str) -> Result<(), ChallengeError> {
        AlpnChallengeResponder::withdraw(self, identifier);
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug)]
pub(crate) struct NoopInstaller;

#[cfg(test)]
impl AlpnChallengeInstaller for NoopInstaller {
    fn install(&self, _domain: &str, _certified_key: Arc<CertifiedKey>) {}
    fn remove(&self, _domain: &str) {}
}
