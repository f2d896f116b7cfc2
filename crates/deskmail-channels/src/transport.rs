//! Mail transport for the IMAP client: TCP connect with optional implicit
//! TLS, and in-place STARTTLS upgrade.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use deskmail_core::models::TlsType;
use deskmail_core::ChannelError;

/// Upper bound for TCP connect and TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Async read+write stream marker.
pub trait MailStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MailStream for T {}

pub type BoxedStream = Box<dyn MailStream>;

/// Open a connection. `Tls` negotiates TLS immediately; `Starttls` and
/// `None` return a plain stream (the protocol client upgrades later).
pub async fn connect(
    host: &str,
    port: u16,
    tls: TlsType,
    skip_verify: bool,
) -> Result<BoxedStream, ChannelError> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ChannelError::Network(format!("connect to {host}:{port} timed out")))?
        .map_err(|e| ChannelError::Network(format!("connect to {host}:{port}: {e}")))?;

    debug!(host, port, tls = %tls, "tcp connected");

    match tls {
        TlsType::Tls => upgrade(Box::new(tcp), host, skip_verify).await,
        TlsType::Starttls | TlsType::None => Ok(Box::new(tcp)),
    }
}

/// Run a TLS handshake over an existing stream.
pub async fn upgrade(
    stream: BoxedStream,
    host: &str,
    skip_verify: bool,
) -> Result<BoxedStream, ChannelError> {
    let connector = TlsConnector::from(Arc::new(client_config(skip_verify)?));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ChannelError::Config(format!("invalid server name '{host}': {e}")))?;

    let tls = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| ChannelError::Network(format!("TLS handshake with {host} timed out")))?
        .map_err(|e| ChannelError::Network(format!("TLS handshake with {host}: {e}")))?;

    Ok(Box::new(tls))
}

fn client_config(skip_verify: bool) -> Result<ClientConfig, ChannelError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ChannelError::Config(format!("TLS setup: {e}")))?;

    if skip_verify {
        warn!("TLS certificate verification disabled");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Verifier used for `tls_skip_verify` inboxes.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
