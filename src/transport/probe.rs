//! Handshake probes against a target's migration ports
//!
//! Before the transfer starts, the controller dials every port the target
//! advertised with the session's source credentials. A port only counts as
//! ready once the full mutual handshake succeeded and the target presented
//! the expected target identity.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{server, TlsAcceptor, TlsConnector};
use tracing::{debug, instrument};

use super::verifier::{client_config, server_config};
use super::{uri_sans, Result, SessionCredentials, TransportError};

/// Default budget for connect and handshake on one port
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a late rejection after the client finished
const CONFIRM_WINDOW: Duration = Duration::from_millis(500);

/// Address and ports a target listens on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetEndpoint {
    /// Target pod address
    pub address: IpAddr,
    /// Every advertised migration port
    pub ports: Vec<u16>,
}

/// Verifies a target is reachable and speaks for the right session
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandshakeProber: Send + Sync {
    /// Complete a mutual handshake on every port of `endpoint`
    async fn probe(
        &self,
        endpoint: &TargetEndpoint,
        credentials: &SessionCredentials,
    ) -> Result<()>;
}

/// [`HandshakeProber`] that dials the target over TCP
#[derive(Clone, Debug)]
pub struct TlsHandshakeProber {
    timeout: Duration,
}

impl Default for TlsHandshakeProber {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl TlsHandshakeProber {
    /// Prober with a custom per-port timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn probe_port(
        &self,
        connector: &TlsConnector,
        addr: SocketAddr,
        expected_target: &str,
    ) -> Result<()> {
        let fail = |reason: String| TransportError::Handshake {
            endpoint: addr.to_string(),
            reason,
        };

        let tcp = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| fail("connect timed out".to_string()))?
            .map_err(|e| fail(e.to_string()))?;

        let mut tls = timeout(
            self.timeout,
            connector.connect(ServerName::from(addr.ip()), tcp),
        )
        .await
        .map_err(|_| fail("handshake timed out".to_string()))?
        .map_err(|e| fail(e.to_string()))?;

        verify_peer_identity(tls.get_ref().1.peer_certificates(), expected_target)?;

        // With TLS 1.3 the server judges our certificate after we consider
        // the handshake complete; its verdict arrives as an alert
        let mut buf = [0u8; 1];
        if let Ok(Err(e)) = timeout(CONFIRM_WINDOW, tls.read(&mut buf)).await {
            if e.kind() == io::ErrorKind::InvalidData {
                return Err(fail(e.to_string()));
            }
        }
        let _ = tls.shutdown().await;

        debug!(endpoint = %addr, "migration port handshake succeeded");
        Ok(())
    }
}

#[async_trait]
impl HandshakeProber for TlsHandshakeProber {
    #[instrument(skip(self, credentials), fields(address = %endpoint.address))]
    async fn probe(
        &self,
        endpoint: &TargetEndpoint,
        credentials: &SessionCredentials,
    ) -> Result<()> {
        let connector = TlsConnector::from(client_config(credentials)?);
        let expected = credentials.target_identity.uri();
        for port in &endpoint.ports {
            self.probe_port(
                &connector,
                SocketAddr::new(endpoint.address, *port),
                &expected,
            )
            .await?;
        }
        Ok(())
    }
}

/// Check that the first presented certificate names `expected`
pub fn verify_peer_identity(
    certificates: Option<&[CertificateDer<'_>]>,
    expected: &str,
) -> Result<()> {
    let leaf = certificates
        .and_then(|certs| certs.first())
        .ok_or_else(|| TransportError::IdentityMismatch {
            expected: expected.to_string(),
            found: Vec::new(),
        })?;
    let found = uri_sans(leaf.as_ref())?;
    if found.iter().any(|uri| uri == expected) {
        Ok(())
    } else {
        Err(TransportError::IdentityMismatch {
            expected: expected.to_string(),
            found,
        })
    }
}

/// Target-side listener gate for one session
pub struct SessionAcceptor {
    acceptor: TlsAcceptor,
}

impl SessionAcceptor {
    /// Acceptor presenting the target certificate and pinning the source
    pub fn new(credentials: &SessionCredentials) -> Result<Self> {
        Ok(Self {
            acceptor: TlsAcceptor::from(server_config(credentials)?),
        })
    }

    /// Run the handshake on an accepted connection
    pub async fn accept<IO>(&self, io: IO) -> Result<server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(self.acceptor.accept(io).await?)
    }
}
