use crate::common::{FakeAcme, Validation, free_local_address, rate_limited};
use lpcert::challenge::{ChallengeType, HttpChallengeResponder};
use lpcert::config::ManagerConfig;
use lpcert::crypto::keys::KeyType;
use lpcert::error::{FatalError, IssuanceError};
use lpcert::store::CertificateStore;
use lpcert::{CertificateLifecycleManager, CertificateMaterial, ManagerState, RenewOutcome};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use test_log::test;
use time::Duration;

mod common;

fn http_config(dir: &Path, hostnames: &[&str], listen: SocketAddr) -> ManagerConfig {
    ManagerConfig::builder()
        .hostnames(hostnames.iter().copied())
        .key_file(dir.join("ssl/key.pem"))
        .cert_file(dir.join("ssl/cert.pem"))
        .challenge_type(ChallengeType::Http01)
        .http_listen_address(listen.ip())
        .http_listen_port(listen.port())
        .key_type(KeyType::EcdsaP256)
        .build()
        .unwrap()
}

type Delivered = Arc<Mutex<Vec<Arc<CertificateMaterial>>>>;

fn recorder() -> (Delivered, lpcert::CertificateCallback) {
    let delivered: Delivered = Arc::default();
    let sink = delivered.clone();
    (
        delivered,
        Arc::new(move |material| sink.lock().push(material)),
    )
}

async fn store_pair(store: &CertificateStore, remaining: Duration) -> CertificateMaterial {
    let (key, chain) = common::self_signed_pair(&["node.example.org"], remaining);
    let material = CertificateMaterial::from_pem(key, chain).unwrap();
    store.save(&material).await.unwrap();
    material
}

#[test(tokio::test)]
async fn test_cold_start_with_http01() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listen = free_local_address();
    let ca = Arc::new(FakeAcme::new(Validation::Http(listen)));
    let config = http_config(dir.path(), &["node.example.org"], listen);
    let manager = CertificateLifecycleManager::new(config, ca.clone());
    let (delivered, notify) = recorder();

    let handle = manager.init(notify).await?;

    assert_eq!(ca.calls(), 1);
    assert_eq!(manager.state(), ManagerState::Serving);
    let delivered = delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    let leaf = delivered[0].leaf()?;
    assert_eq!(leaf.subject, "CN=node.example.org");
    assert_eq!(leaf.subject_alternative_names, vec!["node.example.org"]);
    assert!(delivered[0].time_to_expiration(time::OffsetDateTime::now_utc()) > Duration::days(89));

    let stored = manager.store().load().await.expect("certificate must be persisted");
    assert_eq!(stored, *delivered[0]);
    // The challenge listener is gone again
    assert!(std::net::TcpListener::bind(listen).is_ok());
    handle.abort();
    Ok(())
}

#[test(tokio::test)]
async fn test_first_issuance_failure_is_fatal() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listen = free_local_address();
    let ca = Arc::new(FakeAcme::new(Validation::None));
    ca.fail_with(rate_limited);
    let manager = CertificateLifecycleManager::new(
        http_config(dir.path(), &["node.example.org"], listen),
        ca.clone(),
    );
    let (delivered, notify) = recorder();

    let result = manager.init(notify).await;

    assert!(matches!(
        result,
        Err(FatalError::FirstIssuance(IssuanceError::RateLimited(_)))
    ));
    assert!(delivered.lock().is_empty());
    assert_eq!(manager.state(), ManagerState::WaitingFirstCertificate);
    assert!(!dir.path().join("ssl/cert.pem").exists());
    Ok(())
}

#[test(tokio::test)]
async fn test_certificate_outside_renewal_window_is_kept() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ca = Arc::new(FakeAcme::new(Validation::None));
    let config = http_config(dir.path(), &["node.example.org"], free_local_address());
    let manager = CertificateLifecycleManager::new(config, ca.clone());
    let existing = store_pair(manager.store(), Duration::days(20)).await;
    let (delivered, notify) = recorder();

    let handle = manager.init(notify).await?;
    let outcome = manager.check_and_renew().await?;

    assert!(matches!(
        outcome,
        RenewOutcome::NotDue { .. } | RenewOutcome::AlreadyRunning
    ));
    // The background check started by init may still hold the lock, so check once more after it
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(matches!(
        manager.check_and_renew().await?,
        RenewOutcome::NotDue { .. }
    ));
    assert_eq!(ca.calls(), 0);
    let delivered = delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(*delivered[0], existing);
    handle.abort();
    Ok(())
}

#[test(tokio::test)]
async fn test_failed_renewal_keeps_current_certificate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ca = Arc::new(FakeAcme::new(Validation::None));
    ca.fail_with(rate_limited);
    let config = http_config(dir.path(), &["node.example.org"], free_local_address());
    let manager = CertificateLifecycleManager::new(config, ca.clone());
    let existing = store_pair(manager.store(), Duration::days(10)).await;
    let key_before = std::fs::read(manager.store().key_file())?;
    let cert_before = std::fs::read(manager.store().cert_file())?;

    let result = manager.check_and_renew().await;

    assert!(matches!(result, Err(IssuanceError::RateLimited(_))));
    assert_eq!(ca.calls(), 1);
    assert_eq!(std::fs::read(manager.store().key_file())?, key_before);
    assert_eq!(std::fs::read(manager.store().cert_file())?, cert_before);
    assert_eq!(manager.store().load().await, Some(existing));
    Ok(())
}

#[test(tokio::test)]
async fn test_renewal_reuses_private_key() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ca = Arc::new(FakeAcme::new(Validation::None));
    let config = http_config(dir.path(), &["node.example.org"], free_local_address());
    let manager = CertificateLifecycleManager::new(config, ca.clone());
    let existing = store_pair(manager.store(), Duration::days(10)).await;

    let outcome = manager.check_and_renew().await?;

    let RenewOutcome::Renewed(renewed) = outcome else {
        panic!("expected a renewal, got {outcome:?}");
    };
    assert_eq!(
        renewed.leaf()?.subject_public_key_info,
        existing.leaf()?.subject_public_key_info
    );
    assert_ne!(renewed.certificate_chain_pem(), existing.certificate_chain_pem());
    assert_eq!(manager.current(), Some(renewed));
    Ok(())
}

#[test(tokio::test)]
async fn test_multiple_hostnames_share_one_listener() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listen = free_local_address();
    let hostnames = ["a.example.org", "b.example.org", "c.example.org"];
    let ca = Arc::new(FakeAcme::new(Validation::Http(listen)));
    let responder = Arc::new(HttpChallengeResponder::new(listen));
    let manager = CertificateLifecycleManager::with_challenge_handler(
        http_config(dir.path(), &hostnames, listen),
        ca.clone(),
        responder.clone(),
    );

    let outcome = manager.check_and_renew().await?;

    let RenewOutcome::Renewed(material) = outcome else {
        panic!("expected a renewal, got {outcome:?}");
    };
    let leaf = material.leaf()?;
    assert_eq!(leaf.subject, "CN=a.example.org");
    assert_eq!(leaf.subject_alternative_names, hostnames);
    assert_eq!(ca.offered().len(), 3);
    assert_eq!(responder.listener_starts(), 1);
    assert_eq!(responder.listener_stops(), 1);
    assert!(!responder.is_listening().await);
    Ok(())
}
