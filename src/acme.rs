use crate::challenge::{ChallengeHandler, ChallengeType};
use crate::error::{IssuanceError, IssueContext, IssueResult};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::future;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_POLL_DELAY: Duration = Duration::from_secs(1);
const MAX_POLL_DELAY: Duration = Duration::from_secs(10);
const ORDER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Runs a complete ACME order: account, order, authorizations, finalization and chain download.
///
/// Proofs are provisioned through `handler`. Implementations withdraw every offered challenge
/// before returning, whatever the outcome.
#[async_trait]
pub trait AcmeProtocolClient: Send + Sync {
    async fn request_certificate(
        &self,
        csr_der: &[u8],
        identifiers: &[String],
        handler: &dyn ChallengeHandler,
    ) -> IssueResult<String>;
}

/// [`AcmeProtocolClient`] backed by `instant-acme`.
pub struct InstantAcmeClient {
    directory_url: Url,
    contact: Vec<String>,
    account_file: Option<PathBuf>,
    account: Mutex<Option<Arc<Account>>>,
}

impl InstantAcmeClient {
    pub fn new(directory_url: Url, contact: Vec<String>, account_file: Option<PathBuf>) -> Self {
        Self {
            directory_url,
            contact,
            account_file,
            account: Mutex::new(None),
        }
    }

    async fn account(&self) -> IssueResult<Arc<Account>> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }
        let account = Arc::new(self.load_or_create_account().await?);
        *cached = Some(account.clone());
        Ok(account)
    }

    async fn load_or_create_account(&self) -> IssueResult<Account> {
        if let Some(account_file) = &self.account_file {
            if let Some(credentials) = load_credentials(account_file).await.client_failure()? {
                debug!(
                    "Restoring ACME account from {}",
                    account_file.display()
                );
                return Ok(Account::from_credentials(credentials).await?);
            }
        }

        info!(directory = %self.directory_url, "Creating new ACME account");
        let contact = self.contact.iter().map(String::as_str).collect::<Vec<_>>();
        let new_account = NewAccount {
            contact: &contact,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) =
            Account::create(&new_account, self.directory_url.as_str(), None).await?;
        if let Some(account_file) = &self.account_file {
            save_credentials(account_file, &credentials)
                .await
                .client_failure()?;
        }
        Ok(account)
    }
}

async fn load_credentials(account_file: &Path) -> anyhow::Result<Option<AccountCredentials>> {
    let json = match tokio::fs::read_to_string(account_file).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Reading {} failed", account_file.display()));
        }
    };
    let credentials = serde_json::from_str(&json)
        .with_context(|| format!("{} is not a valid ACME account file", account_file.display()))?;
    Ok(Some(credentials))
}

async fn save_credentials(
    account_file: &Path,
    credentials: &AccountCredentials,
) -> anyhow::Result<()> {
    if let Some(parent) = account_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(credentials)?;
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(account_file)
        .await
        .with_context(|| format!("Creating {} failed", account_file.display()))?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

fn acme_challenge_type(challenge_type: ChallengeType) -> instant_acme::ChallengeType {
    match challenge_type {
        ChallengeType::Http01 => instant_acme::ChallengeType::Http01,
        ChallengeType::TlsAlpn01 => instant_acme::ChallengeType::TlsAlpn01,
    }
}

#[derive(Debug)]
struct PendingChallenge {
    domain: String,
    token: String,
    url: String,
    key_authorization: String,
}

#[async_trait]
impl AcmeProtocolClient for InstantAcmeClient {
    async fn request_certificate(
        &self,
        csr_der: &[u8],
        identifiers: &[String],
        handler: &dyn ChallengeHandler,
    ) -> IssueResult<String> {
        let account = self.account().await?;
        let acme_identifiers = identifiers
            .iter()
            .map(|identifier| Identifier::Dns(identifier.clone()))
            .collect::<Vec<_>>();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &acme_identifiers,
            })
            .await?;
        debug!(identifiers = ?identifiers, "Created ACME order");

        let pending = pending_challenges(&mut order, handler.challenge_type()).await?;

        let validation = validate(&mut order, &pending);
        complete_challenges(handler, &pending, validation).await?;

        if order.state().status != OrderStatus::Valid {
            order.finalize(csr_der).await?;
            debug!("Order finalized, waiting for certificate");
        }
        download_certificate(&mut order).await
    }
}

/// Offers all challenges concurrently and, if every offer succeeded, awaits `validation`.
///
/// Each successfully offered challenge is withdrawn before returning, whatever the outcome. A
/// failed offer is reported for its own domain only and does not cancel its siblings.
async fn complete_challenges<F>(
    handler: &dyn ChallengeHandler,
    pending: &[PendingChallenge],
    validation: F,
) -> IssueResult<()>
where
    F: Future<Output = IssueResult<()>>,
{
    let offers = future::join_all(pending.iter().map(|challenge| {
        handler.offer(&challenge.domain, &challenge.token, &challenge.key_authorization)
    }))
    .await;
    let mut offered = Vec::new();
    let mut offer_error = None;
    for (challenge, result) in pending.iter().zip(offers) {
        match result {
            Ok(()) => offered.push(challenge),
            Err(e) => {
                warn!(
                    domain = %challenge.domain,
                    challenge_type = %handler.challenge_type(),
                    token = %challenge.token,
                    "Provisioning challenge failed: {e:#}"
                );
                offer_error.get_or_insert(
                    anyhow::Error::new(e)
                        .context(format!("Provisioning challenge for {} failed", challenge.domain)),
                );
            }
        }
    }

    let outcome = match offer_error {
        Some(e) => Err(IssuanceError::ChallengeFailure(e)),
        None => validation.await,
    };

    let withdrawals = future::join_all(
        offered
            .iter()
            .map(|challenge| handler.withdraw(&challenge.domain, &challenge.token)),
    )
    .await;
    for (challenge, result) in offered.iter().zip(withdrawals) {
        if let Err(e) = result {
            warn!(
                domain = %challenge.domain,
                token = %challenge.token,
                "Withdrawing challenge failed: {e:#}"
            );
        }
    }
    outcome
}

async fn pending_challenges(
    order: &mut Order,
    challenge_type: ChallengeType,
) -> IssueResult<Vec<PendingChallenge>> {
    let wanted = acme_challenge_type(challenge_type);
    let mut pending = Vec::new();
    for authorization in order.authorizations().await? {
        #[allow(unreachable_patterns)]
        let domain = match &authorization.identifier {
            Identifier::Dns(domain) => domain,
            other => {
                return Err(IssuanceError::CaFailure(anyhow!(
                    "Unsupported identifier {other:?} in authorization"
                )));
            }
        };
        match authorization.status {
            AuthorizationStatus::Valid => {
                debug!(%domain, "Authorization is already valid");
                continue;
            }
            AuthorizationStatus::Pending => {}
            status => {
                return Err(IssuanceError::CaFailure(anyhow!(
                    "Authorization for {domain} is {status:?}"
                )));
            }
        }
        let challenge = authorization
            .challenges
            .iter()
            .find(|challenge| challenge.r#type == wanted)
            .ok_or_else(|| {
                IssuanceError::ChallengeFailure(anyhow!(
                    "CA does not offer a {challenge_type} challenge for {domain}"
                ))
            })?;
        pending.push(PendingChallenge {
            domain: domain.clone(),
            token: challenge.token.clone(),
            url: challenge.url.clone(),
            key_authorization: order.key_authorization(challenge).as_str().to_string(),
        });
    }
    Ok(pending)
}

async fn validate(order: &mut Order, pending: &[PendingChallenge]) -> IssueResult<()> {
    for challenge in pending {
        order.set_challenge_ready(&challenge.url).await?;
    }
    let deadline = Instant::now() + ORDER_TIMEOUT;
    let mut delay = INITIAL_POLL_DELAY;
    loop {
        order.refresh().await?;
        let state = order.state();
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                let problem = state
                    .error
                    .as_ref()
                    .map_or_else(|| "no details given".to_string(), |problem| format!("{problem:?}"));
                return Err(IssuanceError::ChallengeFailure(anyhow!(
                    "Order became invalid: {problem}"
                )));
            }
            OrderStatus::Pending | OrderStatus::Processing => {}
        }
        if Instant::now() + delay > deadline {
            return Err(IssuanceError::ChallengeFailure(anyhow!(
                "Validation did not complete within {} seconds",
                ORDER_TIMEOUT.as_secs()
            )));
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
}

async fn download_certificate(order: &mut Order) -> IssueResult<String> {
    let deadline = Instant::now() + ORDER_TIMEOUT;
    let mut delay = INITIAL_POLL_DELAY;
    loop {
        if let Some(chain) = order.certificate().await? {
            return Ok(chain);
        }
        if order.state().status == OrderStatus::Invalid {
            return Err(IssuanceError::CaFailure(anyhow!(
                "Order became invalid during finalization"
            )));
        }
        if Instant::now() + delay > deadline {
            return Err(IssuanceError::CaFailure(anyhow!(
                "Certificate was not issued within {} seconds",
                ORDER_TIMEOUT.as_secs()
            )));
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
}
