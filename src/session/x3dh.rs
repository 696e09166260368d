//! X3DH-style asynchronous key agreement.
//!
//! Both roles combine four Diffie-Hellman outputs in one fixed order:
//!
//! * DH1 = DH(IK_A, SPK_B)
//! * DH2 = DH(EK_A, IK_B)
//! * DH3 = DH(EK_A, SPK_B)
//! * DH4 = DH(EK_A, OPK_B), only when a one-time prekey was used
//!
//! where `IK` is the X25519 chat key of each party. The concatenation is
//! prefixed with 32 `0xFF` bytes and fed through HKDF-SHA256 to produce the
//! 32-byte [`SharedSecret`].

use crate::crypto::kdf::hkdf_sha256;
use crate::crypto::{ChatKeyPair, PreKeyBundlePrivate, PublicPreKeyBundle};
use crate::utils::{AuthenticationError, ProtocolStateError, Result, ValidationError};
use log::debug;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the derived shared secret
pub const SHARED_SECRET_LENGTH: usize = 32;

/// X3DH protocol information string for HKDF
const X3DH_INFO: &[u8] = b"p2p-secure-session/x3dh/v1";

/// The 32-byte output of the key agreement
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LENGTH]);

impl SharedSecret {
    /// Wrap exactly 32 bytes
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidKeyLength` for any other length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SHARED_SECRET_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "shared secret",
                    expected: SHARED_SECRET_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(secret))
    }

    /// The raw secret bytes
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LENGTH] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Public identifiers recorded by the initiator so the responder can find
/// (and invalidate) the prekeys that were used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMetadata {
    /// One-time prekey taken from the bundle, if there was one
    pub used_one_time_pre_key: Option<[u8; 32]>,
    /// Signed prekey taken from the bundle
    pub used_signed_pre_key: [u8; 32],
    /// Initiator's fresh ephemeral public key
    pub ephemeral_key: [u8; 32],
}

/// Initiator side of the key agreement
pub struct Initiator<'a> {
    identity: &'a ChatKeyPair,
}

impl<'a> Initiator<'a> {
    /// Create an initiator around the local chat key pair
    pub fn new(identity: &'a ChatKeyPair) -> Self {
        Self { identity }
    }

    /// Verify the remote bundle and derive the shared secret
    ///
    /// # Arguments
    ///
    /// * `remote_bundle` - The responder's published prekey bundle
    ///
    /// # Returns
    ///
    /// Tuple of (shared secret, handshake metadata)
    pub fn calculate_secret(
        &self,
        remote_bundle: &PublicPreKeyBundle,
    ) -> Result<(SharedSecret, HandshakeMetadata)> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        self.calculate_secret_with_ephemeral(remote_bundle, ephemeral)
    }

    fn calculate_secret_with_ephemeral(
        &self,
        remote_bundle: &PublicPreKeyBundle,
        ephemeral: StaticSecret,
    ) -> Result<(SharedSecret, HandshakeMetadata)> {
        remote_bundle.verify()?;

        let remote_identity = PublicKey::from(remote_bundle.identity_key);
        let remote_signed = PublicKey::from(remote_bundle.signed_pre_key);

        let mut outputs = vec![
            self.identity.secret().diffie_hellman(&remote_signed),
            ephemeral.diffie_hellman(&remote_identity),
            ephemeral.diffie_hellman(&remote_signed),
        ];
        if let Some(one_time) = remote_bundle.one_time_pre_key {
            outputs.push(ephemeral.diffie_hellman(&PublicKey::from(one_time)));
        }

        if outputs.iter().any(|dh| !dh.was_contributory()) {
            return Err(AuthenticationError::InvalidBundle {
                reason: "bundle contains a low-order public key".to_string(),
            }
            .into());
        }

        let secret = derive_shared_secret(outputs.iter().map(|dh| dh.as_bytes()))?;
        let metadata = HandshakeMetadata {
            used_one_time_pre_key: remote_bundle.one_time_pre_key,
            used_signed_pre_key: remote_bundle.signed_pre_key,
            ephemeral_key: PublicKey::from(&ephemeral).to_bytes(),
        };

        debug!(
            "initiator derived shared secret with {} DH terms",
            outputs.len()
        );
        Ok((secret, metadata))
    }
}

/// Responder side of the key agreement
pub struct Responder<'a> {
    identity: &'a ChatKeyPair,
}

impl<'a> Responder<'a> {
    /// Create a responder around the local chat key pair
    pub fn new(identity: &'a ChatKeyPair) -> Self {
        Self { identity }
    }

    /// Recompute the initiator's shared secret from the responder's side
    ///
    /// # Arguments
    ///
    /// * `remote_identity` - Initiator's chat public key
    /// * `remote_ephemeral` - Initiator's ephemeral public key
    /// * `one_time_pre_key` - Private one-time prekey, if the initiator used one
    /// * `signed_pre_key` - Private signed prekey the initiator used
    pub fn secret_from_remote(
        &self,
        remote_identity: &[u8; 32],
        remote_ephemeral: &[u8; 32],
        one_time_pre_key: Option<&StaticSecret>,
        signed_pre_key: &StaticSecret,
    ) -> Result<SharedSecret> {
        let remote_identity = PublicKey::from(*remote_identity);
        let remote_ephemeral = PublicKey::from(*remote_ephemeral);

        let mut outputs = vec![
            signed_pre_key.diffie_hellman(&remote_identity),
            self.identity.secret().diffie_hellman(&remote_ephemeral),
            signed_pre_key.diffie_hellman(&remote_ephemeral),
        ];
        if let Some(one_time) = one_time_pre_key {
            outputs.push(one_time.diffie_hellman(&remote_ephemeral));
        }

        if outputs.iter().any(|dh| !dh.was_contributory()) {
            return Err(ValidationError::MalformedMessage {
                reason: "handshake carries a low-order public key".to_string(),
            }
            .into());
        }

        derive_shared_secret(outputs.iter().map(|dh| dh.as_bytes()))
    }

    /// Recompute the shared secret for a handshake described by `metadata`.
    ///
    /// The private material must match the public keys the metadata names.
    /// A one-time prekey named by the metadata but missing from `private`
    /// is a hard failure.
    pub fn secret_from_metadata(
        &self,
        remote_identity: &[u8; 32],
        metadata: &HandshakeMetadata,
        private: &PreKeyBundlePrivate,
    ) -> Result<SharedSecret> {
        if PublicKey::from(&private.signed_pre_key).to_bytes() != metadata.used_signed_pre_key {
            return Err(ProtocolStateError::MissingPreKey {
                reason: "signed prekey does not match handshake".to_string(),
            }
            .into());
        }

        let one_time = match (metadata.used_one_time_pre_key, &private.one_time_pre_key) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(ProtocolStateError::MissingPreKey {
                    reason: "one-time prekey named by handshake is not available".to_string(),
                }
                .into());
            }
            (Some(public), Some(secret)) => {
                if PublicKey::from(secret).to_bytes() != public {
                    return Err(ProtocolStateError::MissingPreKey {
                        reason: "one-time prekey does not match handshake".to_string(),
                    }
                    .into());
                }
                Some(secret)
            }
        };

        self.secret_from_remote(
            remote_identity,
            &metadata.ephemeral_key,
            one_time,
            &private.signed_pre_key,
        )
    }
}

/// Derive the shared secret from DH outputs using HKDF
fn derive_shared_secret<'a>(dh_outputs: impl Iterator<Item = &'a [u8; 32]>) -> Result<SharedSecret> {
    let mut input_key_material = vec![0xFFu8; 32];
    for dh in dh_outputs {
        input_key_material.extend_from_slice(dh);
    }

    let derived = hkdf_sha256::<SHARED_SECRET_LENGTH>(
        Some(&[0u8; 32]),
        &input_key_material,
        X3DH_INFO,
    );
    input_key_material.zeroize();

    let mut secret = derived?;
    let shared = SharedSecret(secret);
    secret.zeroize();
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PreKeyStore;
    use crate::utils::{ErrorKind, SessionCoreError};

    struct Bob {
        chat: ChatKeyPair,
        prekeys: PreKeyStore,
    }

    fn responder(one_time: usize) -> Bob {
        let chat = ChatKeyPair::generate();
        let mut prekeys = PreKeyStore::new();
        prekeys.generate_signed_pre_key(&chat);
        prekeys.generate_one_time_pre_keys(one_time);
        Bob { chat, prekeys }
    }

    #[test]
    fn test_agreement_symmetry_with_one_time_prekey() {
        let alice = ChatKeyPair::generate();
        let mut bob = responder(1);
        let bundle = bob.prekeys.publish_bundle(&bob.chat).unwrap();

        let (alice_secret, metadata) = Initiator::new(&alice).calculate_secret(&bundle).unwrap();
        assert_eq!(metadata.used_one_time_pre_key, bundle.one_time_pre_key);
        assert_eq!(metadata.used_signed_pre_key, bundle.signed_pre_key);

        let private = bob.prekeys.peek_private(&metadata).unwrap();
        let bob_secret = Responder::new(&bob.chat)
            .secret_from_metadata(&alice.public_key(), &metadata, &private)
            .unwrap();

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn test_agreement_symmetry_without_one_time_prekey() {
        let alice = ChatKeyPair::generate();
        let mut bob = responder(0);
        let bundle = bob.prekeys.publish_bundle(&bob.chat).unwrap();

        let (alice_secret, metadata) = Initiator::new(&alice).calculate_secret(&bundle).unwrap();
        assert!(metadata.used_one_time_pre_key.is_none());

        let private = bob.prekeys.peek_private(&metadata).unwrap();
        let bob_secret = Responder::new(&bob.chat)
            .secret_from_remote(
                &alice.public_key(),
                &metadata.ephemeral_key,
                None,
                &private.signed_pre_key,
            )
            .unwrap();

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn test_one_time_prekey_changes_secret() {
        let alice = ChatKeyPair::generate();
        let mut bob = responder(1);
        let bundle = bob.prekeys.publish_bundle(&bob.chat).unwrap();
        let ephemeral = StaticSecret::random_from_rng(OsRng);

        let (with_otpk, _) = Initiator::new(&alice)
            .calculate_secret_with_ephemeral(&bundle, ephemeral.clone())
            .unwrap();

        let mut stripped = bundle.clone();
        stripped.one_time_pre_key = None;
        let (without_otpk, _) = Initiator::new(&alice)
            .calculate_secret_with_ephemeral(&stripped, ephemeral)
            .unwrap();

        assert_ne!(with_otpk, without_otpk);
    }

    #[test]
    fn test_invalid_bundle_signature() {
        let alice = ChatKeyPair::generate();
        let mut bob = responder(0);
        let mut bundle = bob.prekeys.publish_bundle(&bob.chat).unwrap();
        bundle.signed_pre_key[0] ^= 0x01;

        let err = Initiator::new(&alice).calculate_secret(&bundle).unwrap_err();
        assert!(matches!(
            err,
            SessionCoreError::Authentication(AuthenticationError::InvalidBundle { .. })
        ));
    }

    #[test]
    fn test_missing_one_time_prekey_is_hard_failure() {
        let alice = ChatKeyPair::generate();
        let mut bob = responder(1);
        let bundle = bob.prekeys.publish_bundle(&bob.chat).unwrap();
        let (_, metadata) = Initiator::new(&alice).calculate_secret(&bundle).unwrap();

        let mut private = bob.prekeys.peek_private(&metadata).unwrap();
        private.one_time_pre_key = None;

        let err = Responder::new(&bob.chat)
            .secret_from_metadata(&alice.public_key(), &metadata, &private)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionCoreError::ProtocolState(ProtocolStateError::MissingPreKey { .. })
        ));
    }

    #[test]
    fn test_mismatched_signed_prekey() {
        let alice = ChatKeyPair::generate();
        let mut bob = responder(0);
        let bundle = bob.prekeys.publish_bundle(&bob.chat).unwrap();
        let (_, metadata) = Initiator::new(&alice).calculate_secret(&bundle).unwrap();

        let private = PreKeyBundlePrivate {
            signed_pre_key: StaticSecret::random_from_rng(OsRng),
            one_time_pre_key: None,
        };
        let err = Responder::new(&bob.chat)
            .secret_from_metadata(&alice.public_key(), &metadata, &private)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
    }

    #[test]
    fn test_low_order_ephemeral_is_rejected() {
        let alice = ChatKeyPair::generate();
        let bob = responder(0);
        let signed = StaticSecret::random_from_rng(OsRng);

        let err = Responder::new(&bob.chat)
            .secret_from_remote(&alice.public_key(), &[0u8; 32], None, &signed)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_shared_secret_length() {
        assert!(SharedSecret::from_bytes(&[7u8; 32]).is_ok());

        let err = SharedSecret::from_bytes(&[7u8; 31]).unwrap_err();
        assert!(matches!(
            err,
            SessionCoreError::Validation(ValidationError::InvalidKeyLength {
                expected: 32,
                actual: 31,
                ..
            })
        ));
        assert!(SharedSecret::from_bytes(&[7u8; 33]).is_err());
    }

    #[test]
    fn test_shared_secret_debug_is_redacted() {
        let secret = SharedSecret::from_bytes(&[0xAB; 32]).unwrap();
        assert!(!format!("{:?}", secret).contains("ab"));
    }
}
