use std::fmt::{Debug, Formatter};

pub type IssueResult<T> = Result<T, IssuanceError>;

/// A certificate could not be obtained from the CA.
///
/// Recoverable as long as a previously issued certificate is still being served.
pub enum IssuanceError {
    ClientFailure(anyhow::Error),
    RateLimited(anyhow::Error),
    CaFailure(anyhow::Error),
    ChallengeFailure(anyhow::Error),
    StoreFailure(anyhow::Error),
}

impl IssuanceError {
    pub fn kind(&self) -> &'static str {
        match self {
            IssuanceError::ClientFailure(_) => "client failure",
            IssuanceError::RateLimited(_) => "rate limited",
            IssuanceError::CaFailure(_) => "CA failure",
            IssuanceError::ChallengeFailure(_) => "challenge failure",
            IssuanceError::StoreFailure(_) => "storage failure",
        }
    }
}

impl std::error::Error for IssuanceError {}

impl std::fmt::Display for IssuanceError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            IssuanceError::ClientFailure(err)
            | IssuanceError::RateLimited(err)
            | IssuanceError::CaFailure(err)
            | IssuanceError::ChallengeFailure(err)
            | IssuanceError::StoreFailure(err) => std::fmt::Debug::fmt(err, f),
        }
    }
}

impl Debug for IssuanceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl From<anyhow::Error> for IssuanceError {
    fn from(err: anyhow::Error) -> Self {
        IssuanceError::ClientFailure(err)
    }
}

impl From<StoreError> for IssuanceError {
    fn from(err: StoreError) -> Self {
        IssuanceError::StoreFailure(err.into())
    }
}

impl From<instant_acme::Error> for IssuanceError {
    fn from(err: instant_acme::Error) -> Self {
        match &err {
            instant_acme::Error::Api(problem) => {
                let is_rate_limit = problem
                    .r#type
                    .as_deref()
                    .is_some_and(|typ| typ == "urn:ietf:params:acme:error:rateLimited");
                if is_rate_limit {
                    IssuanceError::RateLimited(err.into())
                } else {
                    IssuanceError::CaFailure(err.into())
                }
            }
            _ => IssuanceError::ClientFailure(err.into()),
        }
    }
}

/// Tags an `anyhow` result with the [`IssuanceError`] kind it represents.
pub trait IssueContext<T> {
    fn client_failure(self) -> IssueResult<T>;
    fn ca_failure(self) -> IssueResult<T>;
}

impl<T> IssueContext<T> for Result<T, anyhow::Error> {
    fn client_failure(self) -> IssueResult<T> {
        self.map_err(IssuanceError::ClientFailure)
    }

    fn ca_failure(self) -> IssueResult<T> {
        self.map_err(IssuanceError::CaFailure)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one hostname must be configured")]
    NoHostnames,
    #[error("{field} needs to be specified for the {challenge_type} challenge type")]
    MissingField {
        field: &'static str,
        challenge_type: &'static str,
    },
    #[error("{0} must be specified")]
    Required(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("reading configuration file failed")]
    Io(#[from] std::io::Error),
    #[error("parsing configuration file failed")]
    Parse(#[from] toml_edit::de::Error),
    #[error("configuration file is not valid TOML")]
    Toml(#[from] toml_edit::TomlError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate or key is not valid PEM/X.509")]
    Parse(#[source] anyhow::Error),
    #[error("private key does not belong to the leaf certificate")]
    Inconsistent,
    #[error("acquiring the certificate store lock failed")]
    Lock(#[source] std::io::Error),
}

impl StoreError {
    pub fn io<P: AsRef<std::path::Path>>(path: P, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Building the TLS-ALPN-01 validation certificate for one domain failed.
#[derive(Debug, thiserror::Error)]
#[error("forging TLS-ALPN-01 certificate for {domain} failed")]
pub struct ForgeryError {
    pub domain: String,
    #[source]
    pub source: anyhow::Error,
}

/// A challenge hook could not provision (or tear down) its proof.
#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error(transparent)]
    Forgery(#[from] ForgeryError),
    #[error("challenge listener failed")]
    Listener(#[source] std::io::Error),
    #[error("{0}")]
    Other(#[source] anyhow::Error),
}

/// Errors that stop the service from starting TLS at all.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("invalid certificate configuration")]
    Config(#[from] ConfigError),
    #[error("first certificate issuance failed, no certificate to fall back to")]
    FirstIssuance(#[source] IssuanceError),
    #[error("loading operator-supplied certificate failed")]
    ManualCertificate(#[source] StoreError),
    #[error("starting certificate file watcher failed")]
    Watch(#[source] anyhow::Error),
    #[error("certificate manager was already initialized")]
    AlreadyInitialized,
}
