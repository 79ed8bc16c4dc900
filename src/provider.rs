use crate::acme::InstantAcmeClient;
use crate::cert::CertificateCallback;
use crate::config::{CertificateSourceConfiguration, Configuration};
use crate::error::{FatalError, StoreError};
use crate::manager::CertificateLifecycleManager;
use crate::server::ServerCredentials;
use crate::store::{CertificateStore, StoreWatcher};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Keeps whatever the provider needs running alive. Dropping it stops renewal or file watching.
pub enum ProviderHandle {
    Acme(JoinHandle<()>),
    Manual(StoreWatcher),
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        if let ProviderHandle::Acme(task) = self {
            task.abort();
        }
    }
}

/// A source of the node's TLS certificate.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Delivers the first certificate to `notify` before returning, and every later one as it
    /// becomes available.
    async fn start(&self, notify: CertificateCallback) -> Result<ProviderHandle, FatalError>;
}

pub struct AcmeProvider {
    manager: CertificateLifecycleManager,
}

impl AcmeProvider {
    pub fn new(manager: CertificateLifecycleManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &CertificateLifecycleManager {
        &self.manager
    }
}

#[async_trait]
impl CertificateProvider for AcmeProvider {
    async fn start(&self, notify: CertificateCallback) -> Result<ProviderHandle, FatalError> {
        let task = self.manager.init(notify).await?;
        Ok(ProviderHandle::Acme(task))
    }
}

/// Serves operator-supplied files and follows their rotation on disk.
pub struct ManualProvider {
    store: CertificateStore,
}

impl ManualProvider {
    pub fn new(store: CertificateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CertificateProvider for ManualProvider {
    async fn start(&self, notify: CertificateCallback) -> Result<ProviderHandle, FatalError> {
        let material = self
            .store
            .try_load()
            .await
            .map_err(FatalError::ManualCertificate)?
            .ok_or_else(|| {
                FatalError::ManualCertificate(StoreError::io(
                    self.store.cert_file(),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ))
            })?;
        let material = Arc::new(material);
        info!(
            cert_file = %self.store.cert_file().display(),
            "Using operator-supplied certificate valid until {}",
            material.not_after()
        );
        notify(material.clone());
        let watcher = self
            .store
            .watch(Some(material), notify)
            .map_err(FatalError::Watch)?;
        Ok(ProviderHandle::Manual(watcher))
    }
}

/// Selects the certificate source named by the configuration.
///
/// TLS-ALPN-01 validation certificates are installed into `credentials`, which must be the
/// resolver of the HTTPS listener.
pub fn provider_from_config(
    config: &Configuration,
    credentials: Arc<ServerCredentials>,
) -> Result<Box<dyn CertificateProvider>, FatalError> {
    match &config.certificate {
        CertificateSourceConfiguration::Acme(acme) => {
            let manager_config = acme.manager_config(&config.storage_directory, Some(credentials))?;
            let client = InstantAcmeClient::new(
                acme.directory_url.clone(),
                acme.contact.clone(),
                acme.account_file(&config.storage_directory),
            );
            let manager = CertificateLifecycleManager::new(manager_config, Arc::new(client));
            Ok(Box::new(AcmeProvider::new(manager)))
        }
        CertificateSourceConfiguration::Manual(manual) => Ok(Box::new(ManualProvider::new(
            CertificateStore::new(&manual.key_file, &manual.cert_file),
        ))),
    }
}
