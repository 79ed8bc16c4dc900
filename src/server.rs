use crate::CRATE_NAME;
use crate::cert::CertificateMaterial;
use crate::challenge::{ACME_TLS_ALPN_NAME, AlpnChallengeInstaller};
use anyhow::{Context, anyhow, bail};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::RwLock;
use rustls::ServerConfig;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Converts PEM certificate chain and private key into a rustls signing identity.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
    let certificates = pem::parse_many(cert_pem)
        .context("Parsing certificate PEM failed")?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect::<Vec<_>>();
    if certificates.is_empty() {
        bail!("No certificate found in PEM");
    }

    let key = pem::parse(key_pem).context("Parsing private key PEM failed")?;
    let key = match key.tag() {
        "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.into_contents())),
        "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(key.into_contents())),
        "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(key.into_contents())),
        other => bail!("Unsupported private key type {other}"),
    };
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| anyhow!("Unsupported private key: {e}"))?;
    Ok(CertifiedKey::new(certificates, signing_key))
}

/// The identity of the HTTPS listener: a hot-swappable default certificate plus the
/// TLS-ALPN-01 validation certificates currently offered to the CA.
#[derive(Debug, Default)]
pub struct ServerCredentials {
    current: RwLock<Option<Arc<CertifiedKey>>>,
    challenges: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ServerCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the certificate presented to new handshakes. Established connections keep theirs.
    pub fn set_credentials(&self, material: &CertificateMaterial) -> anyhow::Result<()> {
        let certified_key =
            certified_key_from_pem(material.certificate_chain_pem(), material.private_key_pem())?;
        *self.current.write() = Some(Arc::new(certified_key));
        info!(
            "Serving certificate valid until {}",
            material.not_after()
        );
        Ok(())
    }

    fn select(&self, server_name: Option<&str>, offers_acme_tls: bool) -> Option<Arc<CertifiedKey>> {
        if offers_acme_tls {
            if let Some(server_name) = server_name {
                if let Some(challenge) = self.challenges.read().get(&server_name.to_ascii_lowercase()) {
                    debug!(domain = server_name, "Presenting TLS-ALPN-01 validation certificate");
                    return Some(challenge.clone());
                }
            }
        }
        let current = self.current.read().clone();
        if current.is_none() {
            trace!("No certificate available yet, rejecting handshake");
        }
        current
    }
}

impl ResolvesServerCert for ServerCredentials {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let offers_acme_tls = client_hello
            .alpn()
            .is_some_and(|mut protocols| protocols.any(|protocol| protocol == ACME_TLS_ALPN_NAME));
        self.select(client_hello.server_name(), offers_acme_tls)
    }
}

impl AlpnChallengeInstaller for ServerCredentials {
    fn install(&self, domain: &str, certified_key: Arc<CertifiedKey>) {
        self.challenges
            .write()
            .insert(domain.to_ascii_lowercase(), certified_key);
    }

    fn remove(&self, domain: &str) {
        self.challenges.write().remove(&domain.to_ascii_lowercase());
    }
}

/// Builds the rustls configuration of the HTTPS listener, resolving certificates via `credentials`.
pub fn server_config(credentials: Arc<ServerCredentials>) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Configuring TLS protocol versions failed")?
    .with_no_client_auth()
    .with_cert_resolver(credentials);
    config.alpn_protocols = vec![
        b"h2".to_vec(),
        b"http/1.1".to_vec(),
        ACME_TLS_ALPN_NAME.to_vec(),
    ];
    Ok(config)
}

/// Serves HTTPS on `listener` until `shutdown` is cancelled.
///
/// Every request receives a fixed status body. Connections negotiating `acme-tls/1` are closed
/// right after the handshake.
pub async fn serve_https(
    listener: TcpListener,
    credentials: Arc<ServerCredentials>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(server_config(credentials)?));
    info!("HTTPS server listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept HTTPS connection: {e}");
                    continue;
                }
            },
            () = shutdown.cancelled() => break,
        };
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(acceptor, stream, peer_addr).await {
                debug!("HTTPS connection from {peer_addr} failed: {e:#}");
            }
        });
    }
    Ok(())
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let mut tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;
    if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
        debug!("Closing TLS-ALPN-01 validation connection from {peer_addr}");
        tls_stream.shutdown().await?;
        return Ok(());
    }
    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service_fn(status_page))
        .await
        .map_err(|e| anyhow!("{e}"))
}

async fn status_page(
    _request: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{CRATE_NAME} is up\n"))));
    response.headers_mut().insert(
        http::header::SERVER,
        http::HeaderValue::from_static(CRATE_NAME),
    );
    Ok(response)
}
