use crate::common::{FakeAcme, Validation};
use lpcert::challenge::{AlpnChallengeResponder, ChallengeType};
use lpcert::config::ManagerConfig;
use lpcert::crypto::keys::KeyType;
use lpcert::server::{ServerCredentials, serve_https};
use lpcert::{CertificateLifecycleManager, CertificateMaterial, RenewOutcome};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use test_log::test;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::{FromDer, X509Certificate};

mod common;

const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";
const DOMAIN: &str = "node.example.org";

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

struct TestServer {
    address: SocketAddr,
    credentials: Arc<ServerCredentials>,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_server() -> anyhow::Result<TestServer> {
    let credentials = Arc::new(ServerCredentials::new());
    let (key, chain) = common::self_signed_pair(&[DOMAIN], time::Duration::days(30));
    credentials.set_credentials(&CertificateMaterial::from_pem(key, chain)?)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_https(listener, credentials.clone(), shutdown.clone()));
    Ok(TestServer {
        address,
        credentials,
        shutdown,
    })
}

async fn connect(address: SocketAddr, alpn: &[u8]) -> anyhow::Result<TlsStream<TcpStream>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(address).await?;
    Ok(connector
        .connect(ServerName::try_from(DOMAIN)?.to_owned(), stream)
        .await?)
}

fn presents_acme_identifier(stream: &TlsStream<TcpStream>) -> anyhow::Result<bool> {
    let certificates = stream
        .get_ref()
        .1
        .peer_certificates()
        .ok_or(anyhow::anyhow!("server sent no certificate"))?;
    let (_, leaf) = X509Certificate::from_der(certificates[0].as_ref())?;
    Ok(leaf
        .extensions()
        .iter()
        .any(|extension| extension.oid.to_id_string() == ACME_IDENTIFIER_OID))
}

#[test(tokio::test)]
async fn test_acme_tls_client_sees_validation_certificate() -> anyhow::Result<()> {
    let server = start_server().await?;
    let responder = AlpnChallengeResponder::new(server.credentials.clone());

    responder.offer(DOMAIN, "token.thumbprint").await?;
    let stream = connect(server.address, b"acme-tls/1").await?;
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"acme-tls/1"[..]));
    assert!(presents_acme_identifier(&stream)?);

    responder.withdraw(DOMAIN);
    let stream = connect(server.address, b"acme-tls/1").await?;
    assert!(!presents_acme_identifier(&stream)?);
    Ok(())
}

#[test(tokio::test)]
async fn test_regular_client_gets_default_certificate_and_status() -> anyhow::Result<()> {
    let server = start_server().await?;
    let responder = AlpnChallengeResponder::new(server.credentials.clone());
    responder.offer(DOMAIN, "token.thumbprint").await?;

    let mut stream = connect(server.address, b"http/1.1").await?;
    assert!(!presents_acme_identifier(&stream)?);
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: {DOMAIN}\r\nConnection: close\r\n\r\n").as_bytes())
        .await?;
    let mut response = Vec::new();
    let mut buffer = [0u8; 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => response.extend_from_slice(&buffer[..read]),
        }
    }
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
    assert!(response.contains("lpcert is up"));
    Ok(())
}

#[test(tokio::test)]
async fn test_issuance_over_tls_alpn_cleans_up() -> anyhow::Result<()> {
    let server = start_server().await?;
    let dir = tempfile::tempdir()?;
    let ca = Arc::new(FakeAcme::new(Validation::None));
    let config = ManagerConfig::builder()
        .hostnames([DOMAIN, "alt.example.org"])
        .key_file(dir.path().join("key.pem"))
        .cert_file(dir.path().join("cert.pem"))
        .challenge_type(ChallengeType::TlsAlpn01)
        .alpn_installer(server.credentials.clone())
        .key_type(KeyType::EcdsaP256)
        .build()?;
    let manager = CertificateLifecycleManager::new(config, ca.clone());

    let outcome = manager.check_and_renew().await?;

    assert!(matches!(outcome, RenewOutcome::Renewed(_)));
    assert_eq!(ca.offered().len(), 2);
    let stream = connect(server.address, b"acme-tls/1").await?;
    assert!(!presents_acme_identifier(&stream)?);
    Ok(())
}
