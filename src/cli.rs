use crate::cert::leaf_certificate;
use crate::config::{
    CertificateSourceConfiguration, Configuration, DEFAULT_CONFIG_FILE, DEFAULT_RENEW_BUFFER,
};
use crate::store::CertificateStore;
use crate::time::humanize_duration;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
pub struct CommandLineArguments {
    /// Path to the configuration file
    #[arg(short, long, env = "LPCERT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `LPCERT_LOG` environment variable)
    #[clap(long, short, action)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Obtain or load the certificate and serve HTTPS with it, renewing and rotating as needed
    Run(RunCommand),
    /// Show the certificate currently stored on disk
    Status,
}

#[derive(Debug, Args, Default)]
pub struct RunCommand {
    /// Address of the HTTPS listener, overriding `listen` from the configuration
    #[clap(short, long)]
    pub listen: Option<SocketAddr>,
}

/// What `lpcert status` knows about the stored certificate.
#[derive(Debug)]
pub struct StatusReport {
    pub cert_file: PathBuf,
    pub certificate: Option<CertificateStatus>,
}

#[derive(Debug)]
pub struct CertificateStatus {
    pub subject: String,
    pub names: Vec<String>,
    pub issuer: String,
    pub not_after: OffsetDateTime,
    pub expires_in: time::Duration,
    /// `None` for operator-supplied certificates, which are never renewed
    pub renews_in: Option<time::Duration>,
}

impl StatusReport {
    pub async fn collect(config: &Configuration, now: OffsetDateTime) -> anyhow::Result<Self> {
        let (store, renew_buffer) = match &config.certificate {
            CertificateSourceConfiguration::Acme(acme) => (
                CertificateStore::new(
                    acme.key_file(&config.storage_directory),
                    acme.cert_file(&config.storage_directory),
                ),
                Some(acme.renew_buffer.map_or(DEFAULT_RENEW_BUFFER, |buffer| *buffer)),
            ),
            CertificateSourceConfiguration::Manual(manual) => (
                CertificateStore::new(&manual.key_file, &manual.cert_file),
                None,
            ),
        };
        let cert_file = store.cert_file().to_path_buf();
        let Some(material) = store.try_load().await? else {
            return Ok(Self {
                cert_file,
                certificate: None,
            });
        };
        let leaf = leaf_certificate(material.certificate_chain_pem())
            .context("Parsing stored certificate failed")?;
        let expires_in = material.time_to_expiration(now);
        let renews_in = renew_buffer.map(|buffer| {
            let buffer = time::Duration::try_from(buffer).unwrap_or(time::Duration::MAX);
            expires_in.saturating_sub(buffer).max(time::Duration::ZERO)
        });
        Ok(Self {
            cert_file,
            certificate: Some(CertificateStatus {
                subject: leaf.subject,
                names: leaf.subject_alternative_names,
                issuer: leaf.issuer,
                not_after: material.not_after(),
                expires_in,
                renews_in,
            }),
        })
    }
}

impl Display for StatusReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Certificate file: {}", self.cert_file.display())?;
        let Some(certificate) = &self.certificate else {
            return writeln!(f, "No certificate stored");
        };
        writeln!(f, "Subject: {}", certificate.subject)?;
        writeln!(f, "Names: {}", certificate.names.join(", "))?;
        writeln!(f, "Issuer: {}", certificate.issuer)?;
        if certificate.expires_in.is_negative() {
            writeln!(
                f,
                "Expired: {} ({} ago)",
                certificate.not_after,
                humanize_duration(certificate.expires_in)
            )?;
        } else {
            writeln!(
                f,
                "Expires: {} (in {})",
                certificate.not_after,
                humanize_duration(certificate.expires_in)
            )?;
        }
        match certificate.renews_in {
            Some(renews_in) if renews_in.is_zero() => writeln!(f, "Renewal: due now"),
            Some(renews_in) => writeln!(f, "Renewal: in {}", humanize_duration(renews_in)),
            None => writeln!(f, "Renewal: managed by the operator"),
        }
    }
}
