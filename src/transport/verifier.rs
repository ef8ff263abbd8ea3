//! TLS configuration for the migration data channel
//!
//! The target side requires a client certificate that chains to the
//! migration CA and names the expected source identity. Anything else
//! (no certificate, a foreign CA, another session's certificate) fails the
//! handshake with a `BadCertificate` alert.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use tracing::{debug, warn};

use super::{parse_pem, uri_sans, IssuedCert, Result, SessionCredentials, TransportError};

/// Client verifier that pins one session identity
#[derive(Debug)]
pub struct SessionClientVerifier {
    /// Chain and signature validation against the migration CA
    inner: Arc<dyn ClientCertVerifier>,
    /// URI SAN the client certificate must carry
    expected: String,
}

impl SessionClientVerifier {
    /// Verifier accepting only `expected_uri`, issued by a CA in `roots`
    pub fn new(roots: RootCertStore, expected_uri: impl Into<String>) -> Result<Self> {
        let inner = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TransportError::Certificate(format!("client verifier: {e}")))?;
        Ok(Self {
            inner,
            expected: expected_uri.into(),
        })
    }
}

fn bad_certificate() -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::NotValidForName)
}

impl ClientCertVerifier for SessionClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        if let Err(e) = self.inner.verify_client_cert(end_entity, intermediates, now) {
            warn!(error = %e, expected = %self.expected, "rejecting migration peer: untrusted certificate");
            return Err(bad_certificate());
        }

        let presented = uri_sans(end_entity.as_ref()).map_err(|e| {
            warn!(error = %e, "rejecting migration peer: unreadable certificate");
            bad_certificate()
        })?;
        if !presented.iter().any(|uri| *uri == self.expected) {
            warn!(
                expected = %self.expected,
                presented = ?presented,
                "rejecting migration peer: certificate is for another session"
            );
            return Err(bad_certificate());
        }

        debug!(peer = %self.expected, "accepted migration peer");
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Root store holding only the CA in `ca_pem`
pub(crate) fn root_store(ca_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(parse_pem(ca_pem)?))?;
    Ok(roots)
}

fn cert_chain(cert: &IssuedCert) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = vec![CertificateDer::from(parse_pem(&cert.cert_pem)?)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(parse_pem(&cert.key_pem)?));
    Ok((chain, key))
}

/// Server side of the data channel, run on the target
pub fn server_config(credentials: &SessionCredentials) -> Result<Arc<ServerConfig>> {
    let verifier = SessionClientVerifier::new(
        root_store(&credentials.ca_cert_pem)?,
        credentials.source_identity.uri(),
    )?;
    let (chain, key) = cert_chain(&credentials.target)?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

/// Client side of the data channel, run on the source
///
/// The target's identity is checked after the handshake; see
/// [`super::probe::verify_peer_identity`].
pub fn client_config(credentials: &SessionCredentials) -> Result<Arc<ClientConfig>> {
    let (chain, key) = cert_chain(&credentials.source)?;
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(&credentials.ca_cert_pem)?)
        .with_client_auth_cert(chain, key)?;
    Ok(Arc::new(config))
}
