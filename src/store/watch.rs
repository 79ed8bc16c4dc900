use crate::cert::{CertificateCallback, CertificateMaterial};
use crate::store::CertificateStore;
use anyhow::Context;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEBOUNCE_DELAY: Duration = Duration::from_millis(150);
const RELOAD_ATTEMPTS: usize = 8;
const RELOAD_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Keeps watching the store's files until dropped.
pub struct StoreWatcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    _thread: std::thread::JoinHandle<()>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for StoreWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl CertificateStore {
    /// Reloads the pair whenever either file changes and hands every new self-consistent pair
    /// to `notify`. `current` is the pair the caller already serves.
    pub fn watch(
        &self,
        current: Option<Arc<CertificateMaterial>>,
        notify: CertificateCallback,
    ) -> anyhow::Result<StoreWatcher> {
        let (tx, rx) = std_mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE_DELAY, tx)?;

        // Watch the directories (non-recursive) so that files replaced by rename keep being seen
        let mut directories = HashSet::new();
        let mut file_names = HashSet::new();
        for file in [self.key_file(), self.cert_file()] {
            directories.insert(super::parent_directory(file).to_path_buf());
            if let Some(name) = file.file_name() {
                file_names.insert(name.to_os_string());
            }
        }
        for directory in &directories {
            debouncer
                .watcher()
                .watch(directory, RecursiveMode::NonRecursive)
                .with_context(|| format!("Watching {} failed", directory.display()))?;
        }

        let (changed_tx, changed_rx) = mpsc::channel(1);
        let thread = std::thread::spawn(move || {
            forward_events(rx, &directories, &file_names, &changed_tx);
        });
        let task = tokio::spawn(reload_loop(self.clone(), changed_rx, current, notify));

        Ok(StoreWatcher {
            _debouncer: debouncer,
            _thread: thread,
            task,
        })
    }

    async fn load_settled(&self) -> Option<CertificateMaterial> {
        for attempt in 1..=RELOAD_ATTEMPTS {
            match self.try_load().await {
                Ok(Some(material)) => return Some(material),
                Ok(None) => debug!(attempt, "Certificate or key file is missing, retrying"),
                Err(e) => debug!(attempt, "Certificate files are not usable yet: {e:#}"),
            }
            if attempt < RELOAD_ATTEMPTS {
                tokio::time::sleep(RELOAD_RETRY_DELAY).await;
            }
        }
        warn!(
            cert_file = %self.cert_file().display(),
            "Certificate files changed but never settled into a matching pair, keeping the current certificate"
        );
        None
    }
}

fn forward_events(
    rx: std_mpsc::Receiver<notify_debouncer_mini::DebounceEventResult>,
    directories: &HashSet<PathBuf>,
    file_names: &HashSet<OsString>,
    changed_tx: &mpsc::Sender<()>,
) {
    for result in rx {
        match result {
            Ok(events) => {
                let relevant = events.iter().any(|event| {
                    let in_directory = event
                        .path
                        .parent()
                        .is_some_and(|parent| directories.iter().any(|d| parent.ends_with(d) || d.ends_with(parent)));
                    let watched_name = event
                        .path
                        .file_name()
                        .is_some_and(|name| file_names.contains(name));
                    in_directory && watched_name
                });
                if relevant {
                    match changed_tx.try_send(()) {
                        // A reload is already pending and will see this change too
                        Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                        Err(mpsc::error::TrySendError::Closed(())) => return,
                    }
                }
            }
            Err(e) => {
                warn!("Certificate file watch error: {e:?}");
            }
        }
    }
}

async fn reload_loop(
    store: CertificateStore,
    mut changed_rx: mpsc::Receiver<()>,
    mut last_delivered: Option<Arc<CertificateMaterial>>,
    notify: CertificateCallback,
) {
    while changed_rx.recv().await.is_some() {
        let Some(material) = store.load_settled().await else {
            continue;
        };
        if last_delivered.as_deref() == Some(&material) {
            debug!("Certificate files touched without changing the pair");
            continue;
        }
        info!(
            cert_file = %store.cert_file().display(),
            "Loaded rotated certificate expiring at {}",
            material.not_after()
        );
        let material = Arc::new(material);
        last_delivered = Some(material.clone());
        notify(material);
    }
}
