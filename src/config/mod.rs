use crate::challenge::ChallengeType;
use crate::challenge::alpn::AlpnChallengeInstaller;
use crate::crypto::keys::KeyType;
use crate::error::ConfigError;
use crate::time::ParsedDuration;
use serde::Deserialize;
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

mod toml;

pub use self::toml::load;

pub const DEFAULT_CONFIG_FILE: &str = "lpcert.toml";
pub const DEFAULT_RENEW_BUFFER: Duration = Duration::from_secs(14 * 24 * 60 * 60);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// On-disk configuration of the certificate subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    pub storage_directory: PathBuf,
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,
    pub certificate: CertificateSourceConfiguration,
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4000)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CertificateSourceConfiguration {
    Acme(AcmeSourceConfiguration),
    Manual(ManualSourceConfiguration),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeSourceConfiguration {
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// File holding this node's public IP address, used together with `dns_proxy` to derive the hostname
    pub ip_address_file: Option<PathBuf>,
    pub dns_proxy: Option<String>,
    pub key_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub challenge_type: ChallengeType,
    pub renew_buffer: Option<ParsedDuration>,
    pub check_interval: Option<ParsedDuration>,
    pub http_listen_port: Option<u16>,
    pub http_listen_address: Option<IpAddr>,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default = "default_directory_url")]
    pub directory_url: Url,
    #[serde(default)]
    pub contact: Vec<String>,
    pub account_file: Option<PathBuf>,
}

fn default_directory_url() -> Url {
    Url::parse(LETS_ENCRYPT_PRODUCTION).expect("BUG: Let's Encrypt directory URL is invalid")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualSourceConfiguration {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
}

impl AcmeSourceConfiguration {
    pub fn key_file(&self, storage_directory: &Path) -> PathBuf {
        resolve(storage_directory, self.key_file.as_deref(), "ssl/key.pem")
    }

    pub fn cert_file(&self, storage_directory: &Path) -> PathBuf {
        resolve(storage_directory, self.cert_file.as_deref(), "ssl/cert.pem")
    }

    pub fn account_file(&self, storage_directory: &Path) -> Option<PathBuf> {
        self.account_file
            .as_deref()
            .map(|file| storage_directory.join(file))
    }

    /// Hostnames to certify: either configured explicitly or derived from the node's IP address.
    pub fn resolve_hostnames(&self) -> Result<Vec<String>, ConfigError> {
        if !self.hostnames.is_empty() {
            return Ok(self.hostnames.clone());
        }
        match (&self.ip_address_file, &self.dns_proxy) {
            (Some(ip_file), Some(dns_proxy)) => {
                let address = std::fs::read_to_string(ip_file)?;
                let address: IpAddr =
                    address
                        .trim()
                        .parse()
                        .map_err(|e| ConfigError::InvalidValue {
                            field: "ip_address_file",
                            reason: format!("{e}"),
                        })?;
                Ok(vec![hostname_from_address(address, dns_proxy)?])
            }
            _ => Err(ConfigError::NoHostnames),
        }
    }

    pub fn manager_config(
        &self,
        storage_directory: &Path,
        alpn_installer: Option<Arc<dyn AlpnChallengeInstaller>>,
    ) -> Result<ManagerConfig, ConfigError> {
        let mut builder = ManagerConfig::builder()
            .hostnames(self.resolve_hostnames()?)
            .key_file(self.key_file(storage_directory))
            .cert_file(self.cert_file(storage_directory))
            .challenge_type(self.challenge_type)
            .key_type(self.key_type);
        if let Some(renew_buffer) = self.renew_buffer {
            builder = builder.renew_buffer(*renew_buffer);
        }
        if let Some(check_interval) = self.check_interval {
            builder = builder.check_interval(*check_interval);
        }
        if let Some(port) = self.http_listen_port {
            builder = builder.http_listen_port(port);
        }
        if let Some(address) = self.http_listen_address {
            builder = builder.http_listen_address(address);
        }
        if let Some(installer) = alpn_installer {
            builder = builder.alpn_installer(installer);
        }
        builder.build()
    }
}

/// `203.0.113.7` behind `dns.example.net` becomes `203-0-113-7.dns.example.net`.
pub fn hostname_from_address(address: IpAddr, dns_proxy: &str) -> Result<String, ConfigError> {
    match address {
        IpAddr::V4(v4) => Ok(format!(
            "{}.{dns_proxy}",
            v4.to_string().replace('.', "-")
        )),
        IpAddr::V6(_) => Err(ConfigError::InvalidValue {
            field: "ip_address_file",
            reason: "only IPv4 addresses can be mapped to a DNS proxy hostname".to_string(),
        }),
    }
}

fn resolve(storage_directory: &Path, configured: Option<&Path>, default: &str) -> PathBuf {
    match configured {
        Some(path) => storage_directory.join(path),
        None => storage_directory.join(default),
    }
}

#[derive(Clone)]
pub enum ChallengeConfig {
    Http01 { listen: SocketAddr },
    TlsAlpn01 { installer: Arc<dyn AlpnChallengeInstaller> },
}

impl ChallengeConfig {
    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            ChallengeConfig::Http01 { .. } => ChallengeType::Http01,
            ChallengeConfig::TlsAlpn01 { .. } => ChallengeType::TlsAlpn01,
        }
    }
}

impl Debug for ChallengeConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeConfig::Http01 { listen } => write!(f, "http-01 on {listen}"),
            ChallengeConfig::TlsAlpn01 { .. } => write!(f, "tls-alpn-01"),
        }
    }
}

/// Validated runtime settings of the certificate lifecycle manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub hostnames: Vec<String>,
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub challenge: ChallengeConfig,
    pub renew_buffer: Duration,
    pub check_interval: Duration,
    pub key_type: KeyType,
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ManagerConfigBuilder {
    hostnames: Vec<String>,
    key_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    challenge_type: Option<ChallengeType>,
    renew_buffer: Option<Duration>,
    check_interval: Option<Duration>,
    key_type: KeyType,
    http_listen_port: Option<u16>,
    http_listen_address: Option<IpAddr>,
    alpn_installer: Option<Arc<dyn AlpnChallengeInstaller>>,
}

impl ManagerConfigBuilder {
    pub fn hostnames<I: IntoIterator<Item = S>, S: Into<String>>(mut self, hostnames: I) -> Self {
        self.hostnames = hostnames.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_file<P: Into<PathBuf>>(mut self, key_file: P) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    pub fn cert_file<P: Into<PathBuf>>(mut self, cert_file: P) -> Self {
        self.cert_file = Some(cert_file.into());
        self
    }

    pub fn challenge_type(mut self, challenge_type: ChallengeType) -> Self {
        self.challenge_type = Some(challenge_type);
        self
    }

    pub fn renew_buffer(mut self, renew_buffer: Duration) -> Self {
        self.renew_buffer = Some(renew_buffer);
        self
    }

    pub fn check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = Some(check_interval);
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn http_listen_port(mut self, port: u16) -> Self {
        self.http_listen_port = Some(port);
        self
    }

    pub fn http_listen_address(mut self, address: IpAddr) -> Self {
        self.http_listen_address = Some(address);
        self
    }

    pub fn alpn_installer(mut self, installer: Arc<dyn AlpnChallengeInstaller>) -> Self {
        self.alpn_installer = Some(installer);
        self
    }

    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        if self.hostnames.is_empty() {
            return Err(ConfigError::NoHostnames);
        }
        if let Some(empty) = self.hostnames.iter().find(|h| h.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "hostnames",
                reason: format!("'{empty}' is not a hostname"),
            });
        }
        let key_file = self.key_file.ok_or(ConfigError::Required("key_file"))?;
        let cert_file = self.cert_file.ok_or(ConfigError::Required("cert_file"))?;
        let challenge_type = self
            .challenge_type
            .ok_or(ConfigError::Required("challenge_type"))?;
        let challenge = match challenge_type {
            ChallengeType::Http01 => {
                let port = self.http_listen_port.ok_or(ConfigError::MissingField {
                    field: "http_listen_port",
                    challenge_type: ChallengeType::Http01.as_str(),
                })?;
                let address = self
                    .http_listen_address
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                ChallengeConfig::Http01 {
                    listen: SocketAddr::new(address, port),
                }
            }
            ChallengeType::TlsAlpn01 => {
                let installer = self.alpn_installer.ok_or(ConfigError::MissingField {
                    field: "ALPN challenge installer",
                    challenge_type: ChallengeType::TlsAlpn01.as_str(),
                })?;
                ChallengeConfig::TlsAlpn01 { installer }
            }
        };
        let check_interval = self.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL);
        if check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "check_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(ManagerConfig {
            hostnames: self.hostnames,
            key_file,
            cert_file,
            challenge,
            renew_buffer: self.renew_buffer.unwrap_or(DEFAULT_RENEW_BUFFER),
            check_interval,
            key_type: self.key_type,
        })
    }
}
