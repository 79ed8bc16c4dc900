#![allow(dead_code)]

use async_trait::async_trait;
use futures::future;
use lpcert::acme::AcmeProtocolClient;
use lpcert::challenge::{ChallengeHandler, ChallengeType};
use lpcert::error::{IssuanceError, IssueResult};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, CertificateSigningRequestParams, IsCa, KeyPair};
use rustls::pki_types::CertificateSigningRequestDer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::{Duration, OffsetDateTime};

/// How the fake CA checks the proofs it was offered.
pub enum Validation {
    /// Trust every offer
    None,
    /// Fetch every token from the HTTP-01 listener at this address
    Http(SocketAddr),
    /// Let the test inspect the provisioned state before the challenges are withdrawn
    Callback(Box<dyn Fn(&[OfferedChallenge]) + Send + Sync>),
}

#[derive(Debug, Clone)]
pub struct OfferedChallenge {
    pub identifier: String,
    pub token: String,
    pub key_authorization: String,
}

/// An in-process ACME CA that signs CSRs with its own root.
pub struct FakeAcme {
    ca_key: KeyPair,
    ca_cert: rcgen::Certificate,
    validity: Duration,
    validation: Validation,
    failure: Mutex<Option<fn() -> IssuanceError>>,
    calls: AtomicUsize,
    offered: Mutex<Vec<OfferedChallenge>>,
}

impl FakeAcme {
    pub fn new(validation: Validation) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Fake ACME Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self {
            ca_key,
            ca_cert,
            validity: Duration::days(90),
            validation,
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
            offered: Mutex::new(Vec::new()),
        }
    }

    /// Makes every following request fail after the challenges were offered and withdrawn.
    pub fn fail_with(&self, failure: fn() -> IssuanceError) {
        *self.failure.lock() = Some(failure);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn offered(&self) -> Vec<OfferedChallenge> {
        self.offered.lock().clone()
    }

    fn sign(&self, csr_der: &[u8]) -> IssueResult<String> {
        let csr = CertificateSigningRequestDer::from(csr_der.to_vec());
        let mut request = CertificateSigningRequestParams::from_der(&csr)
            .map_err(|e| IssuanceError::CaFailure(anyhow::anyhow!("bad CSR: {e}")))?;
        let now = OffsetDateTime::now_utc();
        request.params.not_before = now - Duration::hours(1);
        request.params.not_after = now + self.validity;
        let leaf = request
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|e| IssuanceError::CaFailure(anyhow::anyhow!("signing failed: {e}")))?;
        Ok(format!("{}{}", leaf.pem(), self.ca_cert.pem()))
    }
}

#[async_trait]
impl AcmeProtocolClient for FakeAcme {
    async fn request_certificate(
        &self,
        csr_der: &[u8],
        identifiers: &[String],
        handler: &dyn ChallengeHandler,
    ) -> IssueResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let challenges = identifiers
            .iter()
            .enumerate()
            .map(|(idx, identifier)| OfferedChallenge {
                identifier: identifier.clone(),
                token: format!("token-{idx}-{}", rand::random::<u32>()),
                key_authorization: format!("key-authorization-{idx}.thumbprint"),
            })
            .collect::<Vec<_>>();

        // Offered all at once, like a real client does for a multi-name order
        let offers = future::join_all(challenges.iter().map(|challenge| {
            handler.offer(
                &challenge.identifier,
                &challenge.token,
                &challenge.key_authorization,
            )
        }))
        .await;
        if let Some(error) = offers.into_iter().find_map(Result::err) {
            for challenge in &challenges {
                let _ = handler
                    .withdraw(&challenge.identifier, &challenge.token)
                    .await;
            }
            return Err(IssuanceError::ChallengeFailure(error.into()));
        }
        self.offered.lock().extend(challenges.iter().cloned());

        let validated = match &self.validation {
            Validation::None => Ok(()),
            Validation::Http(address) => validate_http(*address, &challenges).await,
            Validation::Callback(callback) => {
                callback(&challenges);
                Ok(())
            }
        };

        let withdrawals = future::join_all(
            challenges
                .iter()
                .map(|challenge| handler.withdraw(&challenge.identifier, &challenge.token)),
        )
        .await;
        for withdrawal in withdrawals {
            withdrawal.map_err(|e| IssuanceError::ChallengeFailure(e.into()))?;
        }
        validated?;

        if let Some(failure) = *self.failure.lock() {
            return Err(failure());
        }
        assert!(matches!(
            handler.challenge_type(),
            ChallengeType::Http01 | ChallengeType::TlsAlpn01
        ));
        self.sign(csr_der)
    }
}

async fn validate_http(address: SocketAddr, challenges: &[OfferedChallenge]) -> IssueResult<()> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| IssuanceError::ClientFailure(e.into()))?;
    for challenge in challenges {
        let url = format!(
            "http://{address}/.well-known/acme-challenge/{}",
            challenge.token
        );
        let response = client
            .get(&url)
            .header(reqwest::header::HOST, challenge.identifier.as_str())
            .send()
            .await
            .map_err(|e| IssuanceError::ChallengeFailure(e.into()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IssuanceError::ChallengeFailure(e.into()))?;
        if status != reqwest::StatusCode::OK || body != challenge.key_authorization {
            return Err(IssuanceError::ChallengeFailure(anyhow::anyhow!(
                "{url} answered {status} with {body:?}"
            )));
        }
    }
    Ok(())
}

/// A localhost address nothing listens on right now.
pub fn free_local_address() -> SocketAddr {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

pub fn rate_limited() -> IssuanceError {
    IssuanceError::RateLimited(anyhow::anyhow!("too many certificates already issued"))
}

/// Self-signed pair for `hostnames`, valid for `remaining` from now.
pub fn self_signed_pair(hostnames: &[&str], remaining: Duration) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(hostnames.iter().map(|h| (*h).to_string()).collect::<Vec<_>>())
            .unwrap();
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + remaining;
    let cert = params.self_signed(&key).unwrap();
    (key.serialize_pem(), cert.pem())
}
