//! Fixed-size key pair capability for the ratchet layer.

use crate::crypto::ChatKeyPair;
use crate::utils::{Result, ValidationError};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of ratchet keys in bytes
pub const RATCHET_KEY_LENGTH: usize = 32;

/// What the ratchet needs from a local key pair
pub trait RatchetKeyPair {
    /// X25519 private key
    fn private_key(&self) -> [u8; RATCHET_KEY_LENGTH];

    /// X25519 public key
    fn public_key(&self) -> [u8; RATCHET_KEY_LENGTH];
}

/// Exposes a chat key pair through [`RatchetKeyPair`]
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RatchetKeyAdapter {
    private: [u8; RATCHET_KEY_LENGTH],
    public: [u8; RATCHET_KEY_LENGTH],
}

impl RatchetKeyAdapter {
    /// Wrap a chat key pair
    pub fn new(chat_key: &ChatKeyPair) -> Self {
        Self {
            private: chat_key.secret_bytes(),
            public: chat_key.public_key(),
        }
    }

    /// Wrap raw key halves, checking lengths and that they belong together
    pub fn from_slices(private: &[u8], public: &[u8]) -> Result<Self> {
        let private: [u8; RATCHET_KEY_LENGTH] =
            private
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "ratchet private key",
                    expected: RATCHET_KEY_LENGTH,
                    actual: private.len(),
                })?;
        let public: [u8; RATCHET_KEY_LENGTH] =
            public
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "ratchet public key",
                    expected: RATCHET_KEY_LENGTH,
                    actual: public.len(),
                })?;

        let adapter = Self { private, public };
        validate_key_pair(&adapter)?;
        Ok(adapter)
    }
}

impl From<&ChatKeyPair> for RatchetKeyAdapter {
    fn from(chat_key: &ChatKeyPair) -> Self {
        Self::new(chat_key)
    }
}

impl RatchetKeyPair for RatchetKeyAdapter {
    fn private_key(&self) -> [u8; RATCHET_KEY_LENGTH] {
        self.private
    }

    fn public_key(&self) -> [u8; RATCHET_KEY_LENGTH] {
        self.public
    }
}

impl fmt::Debug for RatchetKeyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetKeyAdapter")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Check that the public half is derived from the private half
pub(crate) fn validate_key_pair<K: RatchetKeyPair + ?Sized>(key_pair: &K) -> Result<()> {
    let mut private = key_pair.private_key();
    let derived = PublicKey::from(&StaticSecret::from(private)).to_bytes();
    private.zeroize();

    if bool::from(derived.ct_eq(&key_pair.public_key())) {
        Ok(())
    } else {
        Err(ValidationError::MismatchedKeyPair.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SessionCoreError;

    #[test]
    fn test_adapter_exposes_chat_key() {
        let chat = ChatKeyPair::generate();
        let adapter = RatchetKeyAdapter::from(&chat);

        assert_eq!(adapter.public_key(), chat.public_key());
        assert_eq!(adapter.private_key(), chat.secret_bytes());
        assert!(validate_key_pair(&adapter).is_ok());
    }

    #[test]
    fn test_from_slices() {
        let chat = ChatKeyPair::generate();
        let adapter =
            RatchetKeyAdapter::from_slices(&chat.secret_bytes(), &chat.public_key()).unwrap();
        assert_eq!(adapter.public_key(), chat.public_key());

        let err = RatchetKeyAdapter::from_slices(&chat.secret_bytes()[..16], &chat.public_key())
            .unwrap_err();
        assert!(matches!(
            err,
            SessionCoreError::Validation(ValidationError::InvalidKeyLength { actual: 16, .. })
        ));
    }

    #[test]
    fn test_mismatched_halves() {
        let chat = ChatKeyPair::generate();
        let other = ChatKeyPair::generate();

        let err = RatchetKeyAdapter::from_slices(&chat.secret_bytes(), &other.public_key())
            .unwrap_err();
        assert!(matches!(
            err,
            SessionCoreError::Validation(ValidationError::MismatchedKeyPair)
        ));
    }
}
