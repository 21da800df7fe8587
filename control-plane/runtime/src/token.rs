use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use mesh_control_plane_core::ResourceId;
use rsa::{
    pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey},
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How long an access token may be presented after it is issued.
pub const TOKEN_TTL: Duration = Duration::from_secs(5);

const ALGORITHM: Algorithm = Algorithm::RS256;
const KEY_BITS: usize = 2048;

/// Issues and verifies the access tokens handed to remote peers.
///
/// The key pair lives in memory only: tokens issued before a restart can no
/// longer be verified.
#[derive(Clone)]
pub struct AccessTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to generate signing key: {0}")]
    Key(String),

    #[error("failed to sign access token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("access token expired")]
    Expired,

    #[error("invalid access token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),

    #[error("access token is missing the {0} claim")]
    MissingClaim(&'static str),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    export_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    export_namespace: Option<String>,
}

// === impl AccessTokens ===

impl AccessTokens {
    /// Generates a fresh RSA key pair.
    pub fn generate() -> Result<Self, TokenError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|e| TokenError::Key(e.to_string()))?;
        Self::from_key(&private)
    }

    pub fn from_key(private: &RsaPrivateKey) -> Result<Self, TokenError> {
        let private_der = private
            .to_pkcs1_der()
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let public_der = RsaPublicKey::from(private)
            .to_pkcs1_der()
            .map_err(|e| TokenError::Key(e.to_string()))?;

        Ok(Self {
            encoding: EncodingKey::from_rsa_der(private_der.as_bytes()),
            decoding: DecodingKey::from_rsa_der(public_der.as_bytes()),
            ttl: TOKEN_TTL,
        })
    }

    /// Issues a token authorizing one connection to `export`.
    pub fn issue(&self, export: &ResourceId) -> Result<String, TokenError> {
        let exp = (SystemTime::now() + self.ttl)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.sign(&Claims {
            exp,
            export_name: Some(export.name.clone()),
            export_namespace: Some(export.namespace.clone()),
        })
    }

    /// Verifies `token` and returns the export it authorizes.
    pub fn verify(&self, token: &str) -> Result<ResourceId, TokenError> {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e),
            },
        )?;

        let Claims {
            export_name,
            export_namespace,
            ..
        } = data.claims;
        let name = export_name.ok_or(TokenError::MissingClaim("exportName"))?;
        let namespace = export_namespace.ok_or(TokenError::MissingClaim("exportNamespace"))?;
        Ok(ResourceId::new(namespace, name))
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(ALGORITHM), claims, &self.encoding)
            .map_err(TokenError::Sign)
    }
}

impl std::fmt::Debug for AccessTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokens")
            .field("algorithm", &ALGORITHM)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
