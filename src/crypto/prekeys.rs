//! Prekey bundles and responder-side prekey management.
//!
//! A responder publishes a [`PublicPreKeyBundle`]: its chat identity key, a
//! signed prekey with an XEdDSA signature by the chat key, and optionally one
//! one-time prekey. The matching private material stays in the
//! [`PreKeyStore`], which hands it out as a [`PreKeyBundlePrivate`] and drops
//! each one-time prekey once a handshake that used it has been verified.

use crate::crypto::{xeddsa, ChatKeyPair};
use crate::session::HandshakeMetadata;
use crate::utils::{AuthenticationError, ProtocolStateError, Result};
use log::{debug, warn};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Number of one-time prekeys to generate by default
pub const DEFAULT_PREKEY_COUNT: usize = 100;

/// Replenish the one-time pool when fewer unpublished keys remain
pub const MIN_ONE_TIME_PREKEYS: usize = 10;

/// Maximum age of a signed prekey before rotation (30 days in seconds)
pub const SIGNED_PREKEY_MAX_AGE: u64 = 30 * 24 * 60 * 60;

/// Number of retired signed prekeys kept for in-flight handshakes
const RETIRED_SIGNED_PREKEYS: usize = 2;

/// Domain separation for signed prekey signatures
const SIGNED_PREKEY_DOMAIN: &[u8] = b"p2p-secure-session/signed-prekey/v1";

fn signed_prekey_signing_input(signed_pre_key: &[u8; 32]) -> Vec<u8> {
    let mut input = Vec::with_capacity(SIGNED_PREKEY_DOMAIN.len() + 32);
    input.extend_from_slice(SIGNED_PREKEY_DOMAIN);
    input.extend_from_slice(signed_pre_key);
    input
}

/// Public part of a prekey bundle, as published by a responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPreKeyBundle {
    /// Responder's chat (X3DH identity) public key
    pub identity_key: [u8; 32],
    /// Responder's current signed prekey
    pub signed_pre_key: [u8; 32],
    /// XEdDSA signature over the signed prekey by `identity_key`
    #[serde(with = "serde_bytes")]
    pub signed_pre_key_signature: Vec<u8>,
    /// One-time prekey, if the responder had one left
    pub one_time_pre_key: Option<[u8; 32]>,
}

impl PublicPreKeyBundle {
    /// Build a bundle from untyped byte slices, checking every length
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationError::InvalidBundle` for wrong key lengths
    pub fn from_slices(
        identity_key: &[u8],
        signed_pre_key: &[u8],
        signed_pre_key_signature: &[u8],
        one_time_pre_key: Option<&[u8]>,
    ) -> Result<Self> {
        let key = |what: &str, bytes: &[u8]| -> Result<[u8; 32]> {
            bytes.try_into().map_err(|_| {
                AuthenticationError::InvalidBundle {
                    reason: format!("{what} must be 32 bytes, got {}", bytes.len()),
                }
                .into()
            })
        };

        Ok(Self {
            identity_key: key("identity key", identity_key)?,
            signed_pre_key: key("signed prekey", signed_pre_key)?,
            signed_pre_key_signature: signed_pre_key_signature.to_vec(),
            one_time_pre_key: one_time_pre_key
                .map(|otpk| key("one-time prekey", otpk))
                .transpose()?,
        })
    }

    /// Verify the signed prekey signature against the bundle's identity key
    pub fn verify(&self) -> Result<()> {
        let signature: [u8; xeddsa::XEDDSA_SIGNATURE_LENGTH] = self
            .signed_pre_key_signature
            .as_slice()
            .try_into()
            .map_err(|_| AuthenticationError::InvalidBundle {
                reason: format!(
                    "signed prekey signature must be {} bytes, got {}",
                    xeddsa::XEDDSA_SIGNATURE_LENGTH,
                    self.signed_pre_key_signature.len()
                ),
            })?;

        let input = signed_prekey_signing_input(&self.signed_pre_key);
        if !xeddsa::verify(&self.identity_key, &input, &signature) {
            return Err(AuthenticationError::InvalidBundle {
                reason: "signed prekey signature does not verify".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Deserialize from JSON and verify
    pub fn from_json(json: &str) -> Result<Self> {
        let bundle: Self = serde_json::from_str(json)?;
        bundle.verify()?;
        Ok(bundle)
    }
}

/// Private prekey material a responder needs to finish a handshake
#[derive(Clone)]
pub struct PreKeyBundlePrivate {
    /// Private key of the signed prekey named in the handshake
    pub signed_pre_key: StaticSecret,
    /// Private key of the one-time prekey named in the handshake, if any
    pub one_time_pre_key: Option<StaticSecret>,
}

impl fmt::Debug for PreKeyBundlePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyBundlePrivate")
            .field("signed_pre_key", &"[REDACTED]")
            .field(
                "one_time_pre_key",
                &self.one_time_pre_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

struct SignedPreKeyRecord {
    secret: StaticSecret,
    signature: [u8; xeddsa::XEDDSA_SIGNATURE_LENGTH],
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Responder-side generation, publication and single-use release of prekeys
pub struct PreKeyStore {
    current_signed: Option<[u8; 32]>,
    retired_signed: VecDeque<[u8; 32]>,
    signed: HashMap<[u8; 32], SignedPreKeyRecord>,
    one_time: HashMap<[u8; 32], StaticSecret>,
    unpublished: VecDeque<[u8; 32]>,
    max_signed_age: u64,
}

impl PreKeyStore {
    /// Create an empty prekey store
    pub fn new() -> Self {
        Self::with_max_signed_age(SIGNED_PREKEY_MAX_AGE)
    }

    /// Create an empty prekey store with a custom signed prekey lifetime
    pub fn with_max_signed_age(max_signed_age: u64) -> Self {
        Self {
            current_signed: None,
            retired_signed: VecDeque::new(),
            signed: HashMap::new(),
            one_time: HashMap::new(),
            unpublished: VecDeque::new(),
            max_signed_age,
        }
    }

    /// Generate a new signed prekey, signed by the chat key.
    ///
    /// The previous signed prekey is retired but kept for a while so
    /// handshakes already in flight can still complete.
    pub fn generate_signed_pre_key(&mut self, chat_key: &ChatKeyPair) -> [u8; 32] {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();

        if let Some(previous) = self.current_signed.replace(public) {
            self.retired_signed.push_back(previous);
            while self.retired_signed.len() > RETIRED_SIGNED_PREKEYS {
                if let Some(expired) = self.retired_signed.pop_front() {
                    self.signed.remove(&expired);
                }
            }
        }

        let signature = xeddsa::sign(&chat_key.secret_bytes(), &signed_prekey_signing_input(&public));
        self.signed.insert(
            public,
            SignedPreKeyRecord {
                secret,
                signature,
                created_at: chrono::Utc::now(),
            },
        );
        debug!("generated signed prekey {}", hex::encode(&public[..8]));
        public
    }

    /// Generate `count` one-time prekeys
    pub fn generate_one_time_pre_keys(&mut self, count: usize) -> Vec<[u8; 32]> {
        let mut publics = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret).to_bytes();
            self.one_time.insert(public, secret);
            self.unpublished.push_back(public);
            publics.push(public);
        }
        publics
    }

    /// Publish a bundle with the current signed prekey and, if available, one
    /// one-time prekey that has not been handed out before
    ///
    /// # Errors
    ///
    /// Returns `ProtocolStateError::NoSignedPreKey` before the first signed prekey exists
    pub fn publish_bundle(&mut self, chat_key: &ChatKeyPair) -> Result<PublicPreKeyBundle> {
        let signed_pre_key = self.current_signed.ok_or(ProtocolStateError::NoSignedPreKey)?;
        let record = self
            .signed
            .get(&signed_pre_key)
            .ok_or(ProtocolStateError::NoSignedPreKey)?;

        Ok(PublicPreKeyBundle {
            identity_key: chat_key.public_key(),
            signed_pre_key,
            signed_pre_key_signature: record.signature.to_vec(),
            one_time_pre_key: self.unpublished.pop_front(),
        })
    }

    /// Look up the private material named by handshake metadata without
    /// consuming it.
    ///
    /// Call [`PreKeyStore::consume`] once the handshake has been verified, so
    /// a forged handshake cannot burn a one-time prekey.
    pub fn peek_private(&self, metadata: &HandshakeMetadata) -> Result<PreKeyBundlePrivate> {
        let signed = self
            .signed
            .get(&metadata.used_signed_pre_key)
            .ok_or_else(|| {
                warn!(
                    "handshake names unknown signed prekey {}",
                    hex::encode(&metadata.used_signed_pre_key[..8])
                );
                ProtocolStateError::MissingPreKey {
                    reason: "signed prekey unknown or retired".to_string(),
                }
            })?;

        let one_time_pre_key = metadata
            .used_one_time_pre_key
            .map(|public| {
                self.one_time.get(&public).cloned().ok_or_else(|| {
                    warn!(
                        "handshake names consumed or unknown one-time prekey {}",
                        hex::encode(&public[..8])
                    );
                    missing_one_time_pre_key()
                })
            })
            .transpose()?;

        Ok(PreKeyBundlePrivate {
            signed_pre_key: signed.secret.clone(),
            one_time_pre_key,
        })
    }

    /// Remove the one-time prekey named by handshake metadata.
    ///
    /// A later handshake naming it fails with `MissingPreKey`. Metadata
    /// without a one-time prekey consumes nothing.
    pub fn consume(&mut self, metadata: &HandshakeMetadata) -> Result<()> {
        let Some(public) = metadata.used_one_time_pre_key else {
            return Ok(());
        };

        if self.one_time.remove(&public).is_none() {
            return Err(missing_one_time_pre_key());
        }
        self.unpublished.retain(|candidate| candidate != &public);
        debug!("consumed one-time prekey {}", hex::encode(&public[..8]));
        Ok(())
    }

    /// Number of one-time prekeys not yet handed out in a bundle
    pub fn unpublished_one_time_count(&self) -> usize {
        self.unpublished.len()
    }

    /// Check if more one-time prekeys should be generated
    pub fn needs_more_pre_keys(&self, minimum: usize) -> bool {
        self.unpublished.len() < minimum
    }

    /// Check if the current signed prekey should be rotated
    pub fn should_rotate(&self) -> bool {
        let Some(current) = self.current_signed else {
            return true;
        };
        self.signed.get(&current).map_or(true, |record| {
            let age = chrono::Utc::now()
                .signed_duration_since(record.created_at)
                .num_seconds();
            age < 0 || age as u64 > self.max_signed_age
        })
    }
}

fn missing_one_time_pre_key() -> crate::utils::SessionCoreError {
    ProtocolStateError::MissingPreKey {
        reason: "one-time prekey already consumed or unknown".to_string(),
    }
    .into()
}

impl Default for PreKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PreKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyStore")
            .field("signed_pre_keys", &self.signed.len())
            .field("one_time_pre_keys", &self.one_time.len())
            .field("unpublished", &self.unpublished.len())
            .finish()
    }
}
