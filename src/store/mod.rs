use crate::cert::CertificateMaterial;
use crate::crypto::keys::key_from_pem;
use crate::error::StoreError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub mod lock;
pub mod watch;

pub use lock::StoreLock;
pub use watch::StoreWatcher;

/// The on-disk home of the node's private key and certificate chain.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    key_file: PathBuf,
    cert_file: PathBuf,
}

impl CertificateStore {
    pub fn new<K: Into<PathBuf>, C: Into<PathBuf>>(key_file: K, cert_file: C) -> Self {
        Self {
            key_file: key_file.into(),
            cert_file: cert_file.into(),
        }
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn cert_file(&self) -> &Path {
        &self.cert_file
    }

    fn lock_directory(&self) -> &Path {
        parent_directory(&self.cert_file)
    }

    /// Loads the stored pair, treating every kind of unusable state as "no certificate".
    pub async fn load(&self) -> Option<CertificateMaterial> {
        match self.try_load().await {
            Ok(material) => material,
            Err(e) => {
                warn!(
                    key_file = %self.key_file.display(),
                    cert_file = %self.cert_file.display(),
                    "Stored certificate is unusable: {e:#}"
                );
                None
            }
        }
    }

    /// Loads the stored pair. `Ok(None)` means at least one of the two files does not exist.
    pub async fn try_load(&self) -> Result<Option<CertificateMaterial>, StoreError> {
        let _lock = match StoreLock::shared(self.lock_directory()).await {
            Ok(lock) => lock,
            Err(e) => {
                debug!("Reading certificate store without lock: {e}");
                None
            }
        };
        let Some(key_pem) = read_optional(&self.key_file).await? else {
            return Ok(None);
        };
        let Some(chain_pem) = read_optional(&self.cert_file).await? else {
            return Ok(None);
        };
        CertificateMaterial::from_pem(key_pem, chain_pem).map(Some)
    }

    /// Loads just the private key, so that a renewal can keep the key it already has.
    pub async fn load_private_key(&self) -> Option<rcgen::KeyPair> {
        let key_pem = match read_optional(&self.key_file).await {
            Ok(key_pem) => key_pem?,
            Err(e) => {
                warn!("Reading private key failed: {e:#}");
                return None;
            }
        };
        match key_from_pem(&key_pem) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(
                    key_file = %self.key_file.display(),
                    "Stored private key is unusable, a new one will be generated: {e:#}"
                );
                None
            }
        }
    }

    /// Atomically replaces both files with `material`.
    pub async fn save(&self, material: &CertificateMaterial) -> Result<(), StoreError> {
        for directory in [
            parent_directory(&self.key_file),
            parent_directory(&self.cert_file),
        ] {
            tokio::fs::create_dir_all(directory)
                .await
                .map_err(|e| StoreError::io(directory, e))?;
        }
        let _lock = StoreLock::exclusive(self.lock_directory())
            .await
            .map_err(StoreError::Lock)?;
        let key_tmp = write_temporary(&self.key_file, material.private_key_pem(), true).await?;
        let cert_tmp =
            match write_temporary(&self.cert_file, material.certificate_chain_pem(), false).await {
                Ok(cert_tmp) => cert_tmp,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&key_tmp).await;
                    return Err(e);
                }
            };
        tokio::fs::rename(&key_tmp, &self.key_file)
            .await
            .map_err(|e| StoreError::io(&self.key_file, e))?;
        tokio::fs::rename(&cert_tmp, &self.cert_file)
            .await
            .map_err(|e| StoreError::io(&self.cert_file, e))?;
        debug!(
            cert_file = %self.cert_file.display(),
            "Persisted certificate expiring at {}",
            material.not_after()
        );
        Ok(())
    }
}

fn parent_directory(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn temporary_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent_directory(target).join(format!(".{file_name}.tmp"))
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

async fn write_temporary(target: &Path, contents: &str, private: bool) -> Result<PathBuf, StoreError> {
    let tmp = temporary_path(target);
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;
    let mut file = options
        .open(&tmp)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
    Ok(tmp)
}
