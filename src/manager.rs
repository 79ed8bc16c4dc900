use crate::acme::AcmeProtocolClient;
use crate::cert::{CertificateCallback, CertificateMaterial, create_and_sign_csr};
use crate::challenge::{AlpnChallengeResponder, ChallengeHandler, HttpChallengeResponder};
use crate::config::{ChallengeConfig, ManagerConfig};
use crate::crypto::keys::new_key;
use crate::error::{FatalError, IssuanceError, IssueContext, IssueResult};
use crate::store::CertificateStore;
use crate::time::{humanize_duration, renewal_due};
use anyhow::Context;
use parking_lot::RwLock;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    WaitingFirstCertificate,
    Serving,
}

impl Display for ManagerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::WaitingFirstCertificate => write!(f, "waiting for first certificate"),
            ManagerState::Serving => write!(f, "serving"),
        }
    }
}

#[derive(Debug)]
pub enum RenewOutcome {
    /// The current certificate is valid for longer than the renewal buffer
    NotDue { remaining: time::Duration },
    Renewed(Arc<CertificateMaterial>),
    /// Another check was in flight, nothing was done
    AlreadyRunning,
}

struct ManagerInner {
    config: ManagerConfig,
    store: CertificateStore,
    client: Arc<dyn AcmeProtocolClient>,
    handler: Arc<dyn ChallengeHandler>,
    notify: RwLock<Option<CertificateCallback>>,
    current: RwLock<Option<Arc<CertificateMaterial>>>,
    state: RwLock<ManagerState>,
    renewal: tokio::sync::Mutex<()>,
}

/// Keeps the node's certificate issued and renewed through ACME.
#[derive(Clone)]
pub struct CertificateLifecycleManager {
    inner: Arc<ManagerInner>,
}

impl CertificateLifecycleManager {
    pub fn new(config: ManagerConfig, client: Arc<dyn AcmeProtocolClient>) -> Self {
        let handler: Arc<dyn ChallengeHandler> = match &config.challenge {
            ChallengeConfig::Http01 { listen } => Arc::new(HttpChallengeResponder::new(*listen)),
            ChallengeConfig::TlsAlpn01 { installer } => {
                Arc::new(AlpnChallengeResponder::new(installer.clone()))
            }
        };
        Self::with_challenge_handler(config, client, handler)
    }

    pub fn with_challenge_handler(
        config: ManagerConfig,
        client: Arc<dyn AcmeProtocolClient>,
        handler: Arc<dyn ChallengeHandler>,
    ) -> Self {
        let store = CertificateStore::new(&config.key_file, &config.cert_file);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                client,
                handler,
                notify: RwLock::new(None),
                current: RwLock::new(None),
                state: RwLock::new(ManagerState::Uninitialized),
                renewal: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.read()
    }

    pub fn current(&self) -> Option<Arc<CertificateMaterial>> {
        self.inner.current.read().clone()
    }

    pub fn store(&self) -> &CertificateStore {
        &self.inner.store
    }

    /// Makes a certificate available and starts the periodic renewal check.
    ///
    /// A stored certificate is handed to `notify` right away and checked in the background.
    /// Without one, the first issuance happens before this returns and its failure is fatal.
    pub async fn init(&self, notify: CertificateCallback) -> Result<JoinHandle<()>, FatalError> {
        {
            let mut state = self.inner.state.write();
            if *state != ManagerState::Uninitialized {
                return Err(FatalError::AlreadyInitialized);
            }
            *state = ManagerState::WaitingFirstCertificate;
        }
        *self.inner.notify.write() = Some(notify);

        if let Some(material) = self.inner.store.load().await {
            info!(
                "Loaded stored certificate, valid for {}",
                humanize_duration(material.time_to_expiration(OffsetDateTime::now_utc()))
            );
            self.publish(Arc::new(material));
            let manager = self.clone();
            tokio::spawn(async move { manager.scheduled_check().await });
        } else {
            info!(
                hostnames = ?self.inner.config.hostnames,
                "No usable certificate stored, requesting the first one"
            );
            self.check_and_renew()
                .await
                .map_err(FatalError::FirstIssuance)?;
        }

        Ok(self.spawn_periodic_check())
    }

    /// Renews the certificate if it expires within the renewal buffer.
    ///
    /// Failures leave the current certificate in place, both in memory and on disk.
    pub async fn check_and_renew(&self) -> IssueResult<RenewOutcome> {
        let Ok(_guard) = self.inner.renewal.try_lock() else {
            debug!("Certificate check already in progress, skipping");
            return Ok(RenewOutcome::AlreadyRunning);
        };

        let current = match self.current() {
            Some(current) => Some(current),
            None => self.inner.store.load().await.map(Arc::new),
        };
        if let Some(current) = current {
            let remaining = current.time_to_expiration(OffsetDateTime::now_utc());
            if !renewal_due(remaining, self.inner.config.renew_buffer) {
                info!(
                    "Certificate is not due for renewal, it expires in {}",
                    humanize_duration(remaining)
                );
                return Ok(RenewOutcome::NotDue { remaining });
            }
            info!(
                "Certificate expires in {}, renewing",
                humanize_duration(remaining)
            );
        }

        match self.renew().await {
            Ok(material) => {
                info!(
                    hostnames = ?self.inner.config.hostnames,
                    "Obtained new certificate valid until {}",
                    material.not_after()
                );
                self.publish(material.clone());
                Ok(RenewOutcome::Renewed(material))
            }
            Err(e) => {
                error!(
                    kind = e.kind(),
                    challenge_type = %self.inner.handler.challenge_type(),
                    "Certificate renewal failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn renew(&self) -> IssueResult<Arc<CertificateMaterial>> {
        let config = &self.inner.config;
        let key = match self.inner.store.load_private_key().await {
            Some(key) => {
                debug!("Reusing stored private key");
                key
            }
            None => {
                let key_type = config.key_type;
                info!("Generating new {key_type} private key");
                tokio::task::spawn_blocking(move || new_key(key_type))
                    .await
                    .context("Key generation task failed")
                    .client_failure()?
                    .client_failure()?
            }
        };
        let csr = create_and_sign_csr(&key, &config.hostnames).client_failure()?;
        let chain = self
            .inner
            .client
            .request_certificate(csr.der(), &config.hostnames, self.inner.handler.as_ref())
            .await?;
        let material = CertificateMaterial::from_pem(key.serialize_pem(), chain)
            .context("CA returned an unusable certificate chain")
            .ca_failure()?;
        self.inner.store.save(&material).await?;
        Ok(Arc::new(material))
    }

    fn publish(&self, material: Arc<CertificateMaterial>) {
        *self.inner.current.write() = Some(material.clone());
        *self.inner.state.write() = ManagerState::Serving;
        let notify = self.inner.notify.read().clone();
        if let Some(notify) = notify {
            notify(material);
        }
    }

    async fn scheduled_check(&self) {
        match self.check_and_renew().await {
            Ok(RenewOutcome::AlreadyRunning) => debug!("Skipped certificate check, one is already running"),
            Ok(_) => {}
            Err(_) => warn!(
                "Keeping current certificate after failed renewal, retrying in {}",
                humanize_std_duration(self.inner.config.check_interval)
            ),
        }
    }

    fn spawn_periodic_check(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let manager = manager.clone();
                // Ticks arriving while a check runs end up as AlreadyRunning
                tokio::spawn(async move { manager.scheduled_check().await });
            }
        })
    }
}

fn humanize_std_duration(duration: std::time::Duration) -> String {
    time::Duration::try_from(duration)
        .map_or_else(|_| format!("{duration:?}"), humanize_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::test_support::material_expiring_in;
    use crate::challenge::ChallengeType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct BlockingClient {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl AcmeProtocolClient for BlockingClient {
        async fn request_certificate(
            &self,
            _csr_der: &[u8],
            _identifiers: &[String],
            _handler: &dyn ChallengeHandler,
        ) -> IssueResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Err(IssuanceError::CaFailure(anyhow::anyhow!("CA unavailable")))
        }
    }

    fn manager(dir: &std::path::Path, client: Arc<BlockingClient>) -> CertificateLifecycleManager {
        let config = ManagerConfig::builder()
            .hostnames(["node.example.org"])
            .key_file(dir.join("key.pem"))
            .cert_file(dir.join("cert.pem"))
            .challenge_type(ChallengeType::Http01)
            .http_listen_address("127.0.0.1".parse().unwrap())
            .http_listen_port(0)
            .key_type(crate::crypto::keys::KeyType::EcdsaP256)
            .build()
            .unwrap();
        CertificateLifecycleManager::new(config, client)
    }

    fn blocking_client() -> Arc<BlockingClient> {
        Arc::new(BlockingClient {
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        })
    }

    #[tokio::test]
    async fn test_concurrent_check_is_already_running() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let client = blocking_client();
        let manager = manager(dir.path(), client.clone());

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.check_and_renew().await }
        });
        while client.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = manager.check_and_renew().await?;
        assert!(matches!(second, RenewOutcome::AlreadyRunning));

        client.release.notify_one();
        assert!(first.await?.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fresh_certificate_is_not_renewed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let client = blocking_client();
        let manager = manager(dir.path(), client.clone());
        let material = material_expiring_in(&["node.example.org"], time::Duration::days(20));
        manager.store().save(&material).await?;

        let outcome = manager.check_and_renew().await?;
        assert!(matches!(outcome, RenewOutcome::NotDue { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_init_twice_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = manager(dir.path(), blocking_client());
        let material = material_expiring_in(&["node.example.org"], time::Duration::days(60));
        manager.store().save(&material).await?;

        let handle = manager.init(Arc::new(|_| {})).await?;
        assert_eq!(manager.state(), ManagerState::Serving);
        assert!(matches!(
            manager.init(Arc::new(|_| {})).await,
            Err(FatalError::AlreadyInitialized)
        ));
        handle.abort();
        Ok(())
    }
}
