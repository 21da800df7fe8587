use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::{VerifierBuilderError, WebPkiClientVerifier},
    RootCertStore, ServerConfig,
};
use std::{fmt, sync::Arc};
use thiserror::Error;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// PEM material for mutually authenticated connections between peers.
#[derive(Clone)]
pub struct TlsConfig {
    pub trust_bundle: Vec<u8>,

    /// A certificate chain followed by its private key.
    pub identity: Vec<u8>,
}

/// The peer named by a verified client certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity(pub String);

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),

    #[error("trust bundle contains no certificates")]
    EmptyTrustBundle,

    #[error("identity contains no certificate")]
    MissingCertificate,

    #[error("identity certificate does not name peer {0}")]
    WrongPeer(String),

    #[error(transparent)]
    Verifier(#[from] VerifierBuilderError),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Builds the server side of the API listener for `local_peer`.
///
/// Client certificates are verified against the trust bundle when presented.
/// Clients without one (the local dataplane) are accepted but carry no
/// [`PeerIdentity`].
pub fn server_config(tls: &TlsConfig, local_peer: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&tls.trust_bundle) {
        roots.add(cert?)?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyTrustBundle);
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()?;

    let chain = CertificateDer::pem_slice_iter(&tls.identity)
        .collect::<Result<Vec<_>, _>>()?;
    let leaf = chain.first().ok_or(TlsError::MissingCertificate)?;
    if !dns_names(leaf).iter().any(|name| name == local_peer) {
        return Err(TlsError::WrongPeer(local_peer.to_string()));
    }
    let key = PrivateKeyDer::from_pem_slice(&tls.identity)?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Names the peer presenting `chain`: the first DNS subject alternative name
/// of its end-entity certificate.
pub fn peer_identity(chain: &[CertificateDer<'_>]) -> Option<PeerIdentity> {
    dns_names(chain.first()?)
        .into_iter()
        .next()
        .map(PeerIdentity)
}

fn dns_names(cert: &CertificateDer<'_>) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(cert.as_ref()) else {
        return vec![];
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return vec![];
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            _ => None,
        })
        .collect()
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}
