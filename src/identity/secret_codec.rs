//! Client secret generation and hashing.
//!
//! Secrets are 32 random bytes rendered as lowercase hex. Only an Argon2id hash (keyed with
//! a server-side pepper) and the first eight characters are ever persisted.

use std::{fmt, sync::Arc};

use anyhow::anyhow;
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use once_cell::sync::OnceCell;
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretSlice, SecretString};

use super::error::AuthError;

pub const SECRET_PREFIX_LEN: usize = 8;
const SECRET_BYTES: usize = 32;

/// Output of [`SecretCodec::generate`]; the plaintext leaves the process exactly once.
pub struct GeneratedSecret {
    pub plaintext: SecretString,
    pub hash: String,
    pub prefix: String,
}

#[derive(Clone)]
pub struct SecretCodec {
    pepper: Arc<SecretSlice<u8>>,
    params: Params,
    dummy_hash: Arc<OnceCell<String>>,
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec")
            .field("pepper", &"[REDACTED]")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl SecretCodec {
    #[must_use]
    pub fn new(pepper: impl Into<Vec<u8>>) -> Self {
        Self {
            pepper: Arc::new(SecretSlice::from(pepper.into())),
            params: Params::default(),
            dummy_hash: Arc::new(OnceCell::new()),
        }
    }

    /// Override the Argon2 cost parameters (tests use the minimum).
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self.dummy_hash = Arc::new(OnceCell::new());
        self
    }

    /// Create a new random secret together with its stored hash and display prefix.
    ///
    /// # Errors
    /// Returns an error if the OS RNG or the hasher fails.
    pub fn generate(&self) -> Result<GeneratedSecret, AuthError> {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| AuthError::Store(anyhow!("failed to generate client secret: {err}")))?;
        let plaintext = hex::encode(bytes);
        let hash = self.hash(&plaintext)?;
        let prefix = prefix_of(&plaintext).to_string();
        Ok(GeneratedSecret {
            plaintext: SecretString::from(plaintext),
            hash,
            prefix,
        })
    }

    /// Hash a plaintext secret into a PHC string.
    ///
    /// # Errors
    /// Returns an error if Argon2 rejects the parameters.
    pub fn hash(&self, plaintext: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|err| AuthError::Store(anyhow!("failed to hash client secret: {err}")))?;
        Ok(hash.to_string())
    }

    /// Check a plaintext against a stored hash with Argon2's own verifier.
    /// Malformed hashes never match.
    #[must_use]
    pub fn verify(&self, plaintext: &str, stored_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return false;
        };
        let Ok(argon2) = self.argon2() else {
            return false;
        };
        argon2.verify_password(plaintext.as_bytes(), &parsed).is_ok()
    }

    /// Return the first candidate whose hash matches `plaintext`.
    ///
    /// Every candidate is checked with the slow hash; with no candidates a dummy hash is
    /// verified instead so "unknown client" and "wrong secret" cost the same.
    pub fn find_match<'a, T>(
        &self,
        plaintext: &str,
        candidates: &'a [T],
        hash_of: impl Fn(&T) -> &str,
    ) -> Option<&'a T> {
        if candidates.is_empty() {
            if let Ok(dummy) = self.dummy_hash.get_or_try_init(|| self.hash("dummy")) {
                let _ = self.verify(plaintext, dummy);
            }
            return None;
        }
        candidates
            .iter()
            .find(|candidate| self.verify(plaintext, hash_of(candidate)))
    }

    fn argon2(&self) -> Result<Argon2<'_>, AuthError> {
        Argon2::new_with_secret(
            self.pepper.expose_secret(),
            Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
        .map_err(|_| AuthError::Store(anyhow!("failed to initialize Argon2id")))
    }
}

#[must_use]
pub fn prefix_of(plaintext: &str) -> &str {
    plaintext.get(..SECRET_PREFIX_LEN).unwrap_or(plaintext)
}

#[cfg(test)]
pub(crate) fn test_codec() -> SecretCodec {
    #[allow(clippy::unwrap_used)]
    let params = Params::new(8, 1, 1, None).unwrap();
    SecretCodec::new(b"test-pepper".to_vec()).with_params(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_returns_hex_secret_and_prefix() -> Result<(), AuthError> {
        let codec = test_codec();
        let generated = codec.generate()?;
        let plaintext = generated.plaintext.expose_secret();
        assert_eq!(plaintext.len(), SECRET_BYTES * 2);
        assert!(plaintext.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(generated.prefix.as_str(), &plaintext[..SECRET_PREFIX_LEN]);
        assert!(!generated.hash.contains(plaintext));
        assert!(generated.hash.starts_with("$argon2id$"));
        Ok(())
    }

    #[test]
    fn verify_accepts_only_matching_plaintext() -> Result<(), AuthError> {
        let codec = test_codec();
        let generated = codec.generate()?;
        let plaintext = generated.plaintext.expose_secret();
        assert!(codec.verify(plaintext, &generated.hash));
        assert!(!codec.verify("not-the-secret", &generated.hash));
        assert!(!codec.verify(plaintext, "not-a-phc-string"));
        Ok(())
    }

    #[test]
    fn pepper_is_part_of_the_hash() -> Result<(), AuthError> {
        let codec = test_codec();
        #[allow(clippy::unwrap_used)]
        let other = SecretCodec::new(b"other-pepper".to_vec())
            .with_params(Params::new(8, 1, 1, None).unwrap());
        let generated = codec.generate()?;
        assert!(!other.verify(generated.plaintext.expose_secret(), &generated.hash));
        Ok(())
    }

    #[test]
    fn find_match_scans_candidates() -> Result<(), AuthError> {
        let codec = test_codec();
        let first = codec.generate()?;
        let second = codec.generate()?;
        let candidates = vec![("a", first.hash.clone()), ("b", second.hash.clone())];

        let found = codec.find_match(second.plaintext.expose_secret(), &candidates, |c| c.1.as_str());
        assert_eq!(found.map(|c| c.0), Some("b"));

        let missing = codec.find_match("unknown", &candidates, |c| c.1.as_str());
        assert!(missing.is_none());

        let empty: Vec<(&str, String)> = Vec::new();
        assert!(codec.find_match("unknown", &empty, |c| c.1.as_str()).is_none());
        Ok(())
    }

    #[test]
    fn debug_redacts_pepper() {
        let rendered = format!("{:?}", test_codec());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("test-pepper"));
    }
}
