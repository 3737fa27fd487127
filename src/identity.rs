//! Identity resolution for incoming connections
//!
//! Tokens are issued by the platform's auth service. The tracking core only
//! verifies them.
//!
//! # Token Format
//!
//! Same layout as a Rails MessageVerifier, with URL-safe base64:
//! 1. Encode identity: Base64Url(JSON(identity))
//! 2. Calculate HMAC-SHA256 digest over the encoded part
//! 3. Format: `${encoded}--${digest_hex}`

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::session::Identity;

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 digest
const DIGEST_HEX_LEN: usize = 64;

/// Resolves a connection's credentials to an identity
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `None` when the token is absent, malformed or not trusted
    async fn resolve(&self, token: Option<&str>) -> Option<Identity>;
}

/// Identity verifier using HMAC-SHA256
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    /// Create a new verifier with the given secret key
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Verify a signed token and return the identity it carries
    pub fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        // The payload alphabet may contain '-', the hex digest never does
        let Some((encoded, signature)) = token.rsplit_once("--") else {
            return Err(VerifyError::InvalidFormat);
        };
        if signature.len() != DIGEST_HEX_LEN || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VerifyError::InvalidFormat);
        }

        if !self.verify_signature(encoded.as_bytes(), signature)? {
            return Err(VerifyError::InvalidSignature);
        }

        let json = base64_decode(encoded)?;
        let identity: Identity = serde_json::from_slice(&json)?;
        Ok(identity)
    }

    /// Sign an identity into a token
    pub fn sign(&self, identity: &Identity) -> Result<String, VerifyError> {
        let json = serde_json::to_vec(identity)?;
        let encoded = base64_encode(&json);
        let signature = hex::encode(self.mac(encoded.as_bytes())?);
        Ok(format!("{}--{}", encoded, signature))
    }

    fn verify_signature(&self, data: &[u8], signature: &str) -> Result<bool, VerifyError> {
        let expected_hex = hex::encode(self.mac(data)?);
        Ok(expected_hex.as_bytes().ct_eq(signature.as_bytes()).into())
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>, VerifyError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Resolves identities from signed tokens
pub struct SignedTokenResolver {
    verifier: TokenVerifier,
}

impl SignedTokenResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            verifier: TokenVerifier::new(secret),
        }
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }
}

#[async_trait]
impl IdentityResolver for SignedTokenResolver {
    async fn resolve(&self, token: Option<&str>) -> Option<Identity> {
        let token = token.filter(|t| !t.is_empty())?;
        match self.verifier.verify(token) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(error = %e, "token rejected");
                None
            }
        }
    }
}

/// Errors during token verification
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// URL-safe base64 encode, so tokens survive a query string
fn base64_encode(data: &[u8]) -> String {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    URL_SAFE_NO_PAD.encode(data)
}

/// URL-safe base64 decode
fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    URL_SAFE_NO_PAD.decode(data)
}
