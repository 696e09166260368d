//! Long-term key material and the key-manager contract.
//!
//! Two long-term key pairs belong to every user: an Ed25519 identity key pair
//! that signs envelopes and profiles, and an X25519 chat key pair that serves
//! both as the X3DH identity key and as the initial ratchet key. The
//! [`KeyMaterialProvider`] trait is the only way the session core reaches
//! them; [`KeyManager`] is the in-memory implementation.

use crate::utils::{CollaboratorError, Result, ValidationError};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of X25519 keys in bytes
pub const CHAT_KEY_LENGTH: usize = 32;

/// Ed25519 key pair for cryptographic identity operations
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create an identity key pair from a 32-byte secret key
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidKeyLength` if the secret has the wrong size
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "identity secret key",
                    expected: SECRET_KEY_LENGTH,
                    actual: secret_bytes.len(),
                })?;

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Verify an Ed25519 identity signature.
///
/// Returns `Ok(false)` for a well-formed but wrong signature, including keys
/// that do not decode to a curve point. Only wrong lengths are errors.
pub fn verify_identity_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool> {
    let public_key: [u8; PUBLIC_KEY_LENGTH] =
        public_key
            .try_into()
            .map_err(|_| ValidationError::InvalidKeyLength {
                what: "identity public key",
                expected: PUBLIC_KEY_LENGTH,
                actual: public_key.len(),
            })?;
    let signature: [u8; SIGNATURE_LENGTH] =
        signature
            .try_into()
            .map_err(|_| ValidationError::InvalidKeyLength {
                what: "identity signature",
                expected: SIGNATURE_LENGTH,
                actual: signature.len(),
            })?;

    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return Ok(false);
    };

    Ok(verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .is_ok())
}

/// X25519 key pair used as X3DH identity key and initial ratchet key
#[derive(Clone)]
pub struct ChatKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ChatKeyPair {
    /// Generate a new random chat key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a chat key pair from its 32-byte private key
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidKeyLength` if the secret has the wrong size
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secret: [u8; CHAT_KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "chat secret key",
                    expected: CHAT_KEY_LENGTH,
                    actual: secret_bytes.len(),
                })?;

        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// The public half as bytes
    pub fn public_key(&self) -> [u8; CHAT_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// The private half as bytes
    pub fn secret_bytes(&self) -> [u8; CHAT_KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// The private half for Diffie-Hellman
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for ChatKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatKeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Holder of the long-term key pairs.
///
/// Any call made while the provider is locked or unavailable fails with
/// `CollaboratorError::KeyManagerUnavailable`. Callers must not cache the
/// returned values beyond a single operation.
pub trait KeyMaterialProvider: Send + Sync {
    /// The chat key pair (X3DH identity and initial ratchet key)
    fn chat_key_pair(&self) -> Result<ChatKeyPair>;

    /// Sign a 32-byte hash with the identity private key
    fn identity_sign(&self, hash: &[u8; 32]) -> Result<[u8; SIGNATURE_LENGTH]>;

    /// The Ed25519 identity public key
    fn identity_public_key(&self) -> Result<[u8; PUBLIC_KEY_LENGTH]>;
}

impl<T: KeyMaterialProvider + ?Sized> KeyMaterialProvider for std::sync::Arc<T> {
    fn chat_key_pair(&self) -> Result<ChatKeyPair> {
        (**self).chat_key_pair()
    }

    fn identity_sign(&self, hash: &[u8; 32]) -> Result<[u8; SIGNATURE_LENGTH]> {
        (**self).identity_sign(hash)
    }

    fn identity_public_key(&self) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        (**self).identity_public_key()
    }
}

/// In-memory key manager that can be locked and unlocked
pub struct KeyManager {
    identity: IdentityKeyPair,
    chat: ChatKeyPair,
    locked: AtomicBool,
}

impl KeyManager {
    /// Create a key manager with freshly generated key pairs
    pub fn generate() -> Self {
        Self::from_keys(IdentityKeyPair::generate(), ChatKeyPair::generate())
    }

    /// Create an unlocked key manager from existing key pairs
    pub fn from_keys(identity: IdentityKeyPair, chat: ChatKeyPair) -> Self {
        Self {
            identity,
            chat,
            locked: AtomicBool::new(false),
        }
    }

    /// Make the key material unavailable until [`KeyManager::unlock`]
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    /// Make the key material available again
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    /// Whether the key material is currently unavailable
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            return Err(CollaboratorError::KeyManagerUnavailable.into());
        }
        Ok(())
    }
}

impl KeyMaterialProvider for KeyManager {
    fn chat_key_pair(&self) -> Result<ChatKeyPair> {
        self.ensure_unlocked()?;
        Ok(self.chat.clone())
    }

    fn identity_sign(&self, hash: &[u8; 32]) -> Result<[u8; SIGNATURE_LENGTH]> {
        self.ensure_unlocked()?;
        Ok(self.identity.sign(hash))
    }

    fn identity_public_key(&self) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        self.ensure_unlocked()?;
        Ok(self.identity.public_key_bytes())
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("identity", &self.identity)
            .field("chat", &self.chat)
            .field("locked", &self.is_locked())
            .finish()
    }
}
