//! Secret handling at the engine boundary
//!
//! The encryption primitive itself is an external collaborator: deployments
//! inject an implementation of [`SecretCipher`] wired to their KMS or vault.
//! The engine only ever sees the decrypted `api_key`/`api_secret` pair and
//! compares webhook secrets in constant time.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Decrypted venue API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Capability interface over the secret-at-rest primitive.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> EngineResult<Vec<u8>>;
}

impl dyn SecretCipher {
    /// Decrypt a stored credential blob into an API key pair. Blobs are
    /// base64-wrapped ciphertext of a JSON credential document. The legacy
    /// single-key string format is rejected here.
    pub fn decrypt_credentials(&self, blob: &str) -> EngineResult<ApiCredentials> {
        use base64::Engine as _;
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|e| EngineError::Validation(format!("malformed credential blob: {e}")))?;
        let plaintext = self.decrypt(&ciphertext)?;
        serde_json::from_slice::<ApiCredentials>(&plaintext).map_err(|_| {
            EngineError::Validation(
                "credential blob is not a venue credential document (legacy single-key blobs are not accepted)"
                    .to_string(),
            )
        })
    }

    /// Encrypt an API key pair into a storable blob.
    pub fn encrypt_credentials(&self, credentials: &ApiCredentials) -> String {
        use base64::Engine as _;
        let plaintext = serde_json::to_vec(credentials).expect("credentials serialize");
        base64::engine::general_purpose::STANDARD.encode(self.encrypt(&plaintext))
    }
}

/// Identity cipher for tests and the packaged mock venue. Production
/// deployments must inject a real primitive.
#[derive(Debug, Default)]
pub struct PlainCipher;

impl SecretCipher for PlainCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Constant-time equality for webhook secrets. Always walks the full
/// length of both inputs.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    let max_len = a.len().max(b.len());
    for i in 0..max_len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}
