//! Transport security for migration sessions
//!
//! Every migration gets its own pair of short-lived certificates, issued by
//! the migration CA and bound to the session through a URI SAN naming the
//! migration UID, the role (source or target) and the node:
//!
//! ```text
//! spiffe://ferry.dev/migration/<uid>/source/<node>
//! spiffe://ferry.dev/migration/<uid>/target/<node>
//! ```
//!
//! The target listener only completes a handshake with a peer whose
//! certificate chains to the CA *and* carries the expected source identity
//! (see [`verifier`]). The key material lives in a Secret owned by the
//! migration and is deleted once the migration is terminal.
//!
//! The same CA also issues the controller's own serving and client
//! certificates (admission webhook, transfer handler API).

pub mod probe;
pub mod verifier;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

pub use probe::{HandshakeProber, SessionAcceptor, TargetEndpoint, TlsHandshakeProber};
pub use verifier::{client_config, server_config, SessionClientVerifier};

#[cfg(test)]
pub use probe::MockHandshakeProber;

/// Trust domain used in session identities
pub const TRUST_DOMAIN: &str = "ferry.dev";

/// Days a session certificate stays valid
const SESSION_CERT_DAYS: i64 = 2;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Key or certificate generation failed
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    /// PEM or DER could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// Secret is missing a key
    #[error("session secret is missing {0}")]
    MissingMaterial(&'static str),

    /// TLS configuration error
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake with a port did not complete
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake {
        /// address:port that was probed
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// The peer presented a valid certificate for the wrong identity
    #[error("peer identity mismatch: expected {expected}, found {found:?}")]
    IdentityMismatch {
        /// Identity that was required
        expected: String,
        /// URI SANs the peer presented
        found: Vec<String>,
    },
}

impl From<TransportError> for crate::Error {
    fn from(e: TransportError) -> Self {
        crate::Error::transport(e.to_string())
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| TransportError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

/// URI SANs carried by a DER certificate
pub fn uri_sans(cert_der: &[u8]) -> Result<Vec<String>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| TransportError::Parse(format!("failed to parse certificate: {e}")))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| TransportError::Parse(format!("invalid SAN extension: {e}")))?;
    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) => Some(uri.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Which end of the data channel a certificate is for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// Node the guest is leaving; dials the target
    Source,
    /// Node the guest is moving to; listens
    Target,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Identity of one end of one migration session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Migration the session belongs to
    pub migration_uid: String,
    /// Source or target
    pub role: SessionRole,
    /// Node name
    pub node: String,
}

impl SessionIdentity {
    /// Identity of the source end
    pub fn source(migration_uid: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            migration_uid: migration_uid.into(),
            role: SessionRole::Source,
            node: node.into(),
        }
    }

    /// Identity of the target end
    pub fn target(migration_uid: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            migration_uid: migration_uid.into(),
            role: SessionRole::Target,
            node: node.into(),
        }
    }

    /// URI SAN encoding of the identity
    pub fn uri(&self) -> String {
        format!(
            "spiffe://{TRUST_DOMAIN}/migration/{}/{}/{}",
            self.migration_uid, self.role, self.node
        )
    }
}

/// A certificate with its private key
#[derive(Clone)]
pub struct IssuedCert {
    /// PEM certificate
    pub cert_pem: String,
    /// PEM PKCS#8 private key
    pub key_pem: Zeroizing<String>,
}

impl fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Certificate Authority for migration sessions
pub struct MigrationCa {
    ca_key_pem: Zeroizing<String>,
    ca_cert_pem: String,
}

impl MigrationCa {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("ferry".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = validity(3650);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            TransportError::Certificate(format!("failed to generate CA key: {e}"))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            TransportError::Certificate(format!("failed to create CA cert: {e}"))
        })?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA persisted earlier
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| TransportError::Parse(format!("failed to parse CA key: {e}")))?;
        parse_pem(cert_pem)?;
        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// PEM certificate of the CA
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// PEM private key of the CA
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue both ends of a migration session
    ///
    /// The target certificate also carries `target_address` as an IP SAN so
    /// the source can verify it by address.
    pub fn issue_session(
        &self,
        migration_uid: &str,
        source_node: &str,
        target_node: &str,
        target_address: IpAddr,
    ) -> Result<SessionCredentials> {
        let source_identity = SessionIdentity::source(migration_uid, source_node);
        let target_identity = SessionIdentity::target(migration_uid, target_node);

        let source = self.issue(
            &format!("ferry-migration-{}", SessionRole::Source),
            vec![uri_san(&source_identity.uri())?],
            SESSION_CERT_DAYS,
        )?;
        let target = self.issue(
            &format!("ferry-migration-{}", SessionRole::Target),
            vec![
                uri_san(&target_identity.uri())?,
                SanType::IpAddress(target_address),
            ],
            SESSION_CERT_DAYS,
        )?;

        Ok(SessionCredentials {
            ca_cert_pem: self.ca_cert_pem.clone(),
            source_identity,
            target_identity,
            target_address,
            source,
            target,
        })
    }

    /// Issue a serving certificate for the given DNS names
    pub fn issue_server_cert(&self, dns_names: &[String]) -> Result<IssuedCert> {
        let sans = dns_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| TransportError::Certificate(format!("invalid DNS name: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let cn = dns_names.first().map(String::as_str).unwrap_or("ferry");
        self.issue(cn, sans, 365)
    }

    /// Issue a client certificate identified by `common_name`
    pub fn issue_client_cert(&self, common_name: &str) -> Result<IssuedCert> {
        self.issue(common_name, Vec::new(), 365)
    }

    fn issue(&self, common_name: &str, sans: Vec<SanType>, days: i64) -> Result<IssuedCert> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;
        params.subject_alt_names = sans;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let (not_before, not_after) = validity(days);
        params.not_before = not_before;
        params.not_after = not_after;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| TransportError::Parse(format!("failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| TransportError::Parse(format!("failed to parse CA cert: {e}")))?;

        let key_pair = KeyPair::generate()
            .map_err(|e| TransportError::Certificate(format!("failed to generate key: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| TransportError::Certificate(format!("failed to sign certificate: {e}")))?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }
}

/// Validity window opening five minutes in the past
fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (
        now - ::time::Duration::minutes(5),
        now + ::time::Duration::days(days),
    )
}

fn uri_san(uri: &str) -> Result<SanType> {
    Ia5String::try_from(uri)
        .map(SanType::URI)
        .map_err(|e| TransportError::Certificate(format!("invalid URI SAN {uri}: {e}")))
}

const CA_CERT_KEY: &str = "ca.crt";
const SOURCE_CERT_KEY: &str = "source.crt";
const SOURCE_KEY_KEY: &str = "source.key";
const TARGET_CERT_KEY: &str = "target.crt";
const TARGET_KEY_KEY: &str = "target.key";
const SOURCE_NODE_KEY: &str = "source.node";
const TARGET_NODE_KEY: &str = "target.node";
const MIGRATION_UID_KEY: &str = "migration.uid";
const TARGET_ADDRESS_KEY: &str = "target.address";

/// Name of the Secret holding the session credentials of `migration_name`
pub fn session_secret_name(migration_name: &str) -> String {
    format!("{migration_name}-migration-tls")
}

/// Both ends of one migration session
#[derive(Clone, Debug)]
pub struct SessionCredentials {
    /// CA that issued both certificates
    pub ca_cert_pem: String,
    /// Identity bound into the source certificate
    pub source_identity: SessionIdentity,
    /// Identity bound into the target certificate
    pub target_identity: SessionIdentity,
    /// Address carried as the target's IP SAN
    pub target_address: IpAddr,
    /// Source certificate and key
    pub source: IssuedCert,
    /// Target certificate and key
    pub target: IssuedCert,
}

impl SessionCredentials {
    /// Secret carrying these credentials, owned by the migration
    pub fn to_secret(&self, name: &str, namespace: &str, owner: Option<OwnerReference>) -> Secret {
        let entry = |k: &str, v: &str| (k.to_string(), ByteString(v.as_bytes().to_vec()));
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: owner.map(|o| vec![o]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([
                entry(CA_CERT_KEY, &self.ca_cert_pem),
                entry(SOURCE_CERT_KEY, &self.source.cert_pem),
                entry(SOURCE_KEY_KEY, &self.source.key_pem),
                entry(TARGET_CERT_KEY, &self.target.cert_pem),
                entry(TARGET_KEY_KEY, &self.target.key_pem),
                entry(SOURCE_NODE_KEY, &self.source_identity.node),
                entry(TARGET_NODE_KEY, &self.target_identity.node),
                entry(MIGRATION_UID_KEY, &self.source_identity.migration_uid),
                entry(TARGET_ADDRESS_KEY, &self.target_address.to_string()),
            ])),
            ..Default::default()
        }
    }

    /// Read credentials back from their Secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret
            .data
            .as_ref()
            .ok_or(TransportError::MissingMaterial("data"))?;
        let get = |key: &'static str| -> Result<String> {
            let bytes = data.get(key).ok_or(TransportError::MissingMaterial(key))?;
            String::from_utf8(bytes.0.clone())
                .map_err(|_| TransportError::Parse(format!("{key} is not valid UTF-8")))
        };

        let migration_uid = get(MIGRATION_UID_KEY)?;
        let target_address: IpAddr = get(TARGET_ADDRESS_KEY)?.parse().map_err(|_| {
            TransportError::Parse(format!("{TARGET_ADDRESS_KEY} is not an IP address"))
        })?;
        Ok(Self {
            ca_cert_pem: get(CA_CERT_KEY)?,
            source_identity: SessionIdentity::source(&migration_uid, get(SOURCE_NODE_KEY)?),
            target_identity: SessionIdentity::target(&migration_uid, get(TARGET_NODE_KEY)?),
            target_address,
            source: IssuedCert {
                cert_pem: get(SOURCE_CERT_KEY)?,
                key_pem: Zeroizing::new(get(SOURCE_KEY_KEY)?),
            },
            target: IssuedCert {
                cert_pem: get(TARGET_CERT_KEY)?,
                key_pem: Zeroizing::new(get(TARGET_KEY_KEY)?),
            },
        })
    }

    /// Returns true if these credentials were issued for the given session
    ///
    /// A target restarted on the same node usually comes back with a new
    /// address, which needs a new target certificate.
    pub fn matches(
        &self,
        migration_uid: &str,
        source_node: &str,
        target_node: &str,
        target_address: IpAddr,
    ) -> bool {
        self.source_identity == SessionIdentity::source(migration_uid, source_node)
            && self.target_identity == SessionIdentity::target(migration_uid, target_node)
            && self.target_address == target_address
    }
}
