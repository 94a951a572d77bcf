//! Opaque cursor tokens.
//!
//! The last-seen sort values of a cursor paged select come back from the
//! database as a JSON array. Before they reach the client they are tagged
//! with the fingerprint of the statement and the id of the select they
//! belong to, sealed with AES-256-GCM and base64 encoded. Incoming tokens
//! are opened again before binding.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CursorError {
    #[error("invalid cursor encoding")]
    Encoding,
    #[error("cursor could not be decrypted")]
    Decrypt,
    #[error("cursor encryption failed")]
    Encrypt,
    #[error("cursor belongs to a different field")]
    WrongSelect,
    #[error("cursor belongs to a different query")]
    WrongQuery,
}

/// What a token holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Fingerprint of the statement the token was issued by
    pub scope: String,
    pub sel: usize,
    pub value: String,
}

/// Seals and opens cursor tokens with a key derived from the configured
/// secret.
#[derive(Clone)]
pub struct CursorCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CursorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorCodec").finish_non_exhaustive()
    }
}

impl CursorCodec {
    /// The AES key is the SHA-256 of `secret`.
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Codec with a random key. Tokens do not survive a restart.
    pub fn random() -> Self {
        Self {
            cipher: Aes256Gcm::new(&Aes256Gcm::generate_key(&mut OsRng)),
        }
    }

    /// Token for the cursor `value` of select `sel` in the statement
    /// fingerprinted by `scope`. `scope` must not contain ':'.
    pub fn encrypt(&self, scope: &str, sel: usize, value: &str) -> Result<String, CursorError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let plain = format!("{}:{}:{}", scope, sel, value);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|_| CursorError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD_NO_PAD.encode(out))
    }

    pub fn decrypt(&self, token: &str) -> Result<Sealed, CursorError> {
        let data = STANDARD_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|_| CursorError::Encoding)?;
        if data.len() <= NONCE_LEN {
            return Err(CursorError::Encoding);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CursorError::Decrypt)?;
        let plain = String::from_utf8(plain).map_err(|_| CursorError::Encoding)?;

        let mut parts = plain.splitn(3, ':');
        let (Some(scope), Some(sel), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CursorError::Encoding);
        };
        Ok(Sealed {
            scope: scope.to_string(),
            sel: sel.parse().map_err(|_| CursorError::Encoding)?,
            value: value.to_string(),
        })
    }

    /// Cursor value of `token`, which must have been issued for select
    /// `sel` of the statement fingerprinted by `scope`.
    pub fn open_for(&self, scope: &str, sel: usize, token: &str) -> Result<String, CursorError> {
        let s = self.decrypt(token)?;
        if s.scope != scope {
            return Err(CursorError::WrongQuery);
        }
        if s.sel != sel {
            return Err(CursorError::WrongSelect);
        }
        Ok(s.value)
    }
}
