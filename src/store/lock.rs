use crate::CRATE_NAME;
use fs4::tokio::AsyncFileExt;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, error};

pub const LOCK_FILE_NAME: &str = ".lpcert.lock";

async fn open_lock_file(directory: &Path) -> std::io::Result<File> {
    // Never truncate: the file is only a lock handle and writes would wake up file watchers
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(directory.join(LOCK_FILE_NAME))
        .await
}

async fn exclusive_lock(directory: &Path) -> std::io::Result<File> {
    let lock_file = open_lock_file(directory).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        debug!(
            "Another {CRATE_NAME} process is currently accessing the certificate store. Waiting for it to finish..."
        );
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

async fn shared_lock(directory: &Path) -> std::io::Result<Option<File>> {
    // Readers never create the lock file: only a writer can hold it, and without one there is no
    // writer to wait for
    let lock_file = match OpenOptions::new()
        .read(true)
        .open(directory.join(LOCK_FILE_NAME))
        .await
    {
        Ok(lock_file) => lock_file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if lock_file.try_lock_shared()? {
        Ok(Some(lock_file))
    } else {
        tokio::task::spawn_blocking(move || {
            lock_file.lock_shared()?;
            Ok(Some(lock_file))
        })
        .await?
    }
}

/// Advisory lock on a certificate store directory, released on drop.
///
/// Writers hold it exclusively across replacing both files, readers hold it shared while
/// reading both, so neither side can observe half of a rotation.
#[must_use]
#[clippy::has_significant_drop]
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    pub async fn exclusive(directory: &Path) -> std::io::Result<Self> {
        let lock_file = exclusive_lock(directory).await?;
        Ok(Self { lock_file })
    }

    /// Shared lock for readers. `None` if no writer ever created the lock file.
    pub async fn shared(directory: &Path) -> std::io::Result<Option<Self>> {
        let lock_file = shared_lock(directory).await?;
        Ok(lock_file.map(|lock_file| Self { lock_file }))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release certificate store lock: {e}");
        }
    }
}
