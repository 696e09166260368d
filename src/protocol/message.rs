//! Signed messages and their canonical signing encoding.
//!
//! # Signing encoding, version 1
//!
//! The signature covers the SHA-256 hash of the following bytes, in order:
//!
//! | field                      | encoding                                   |
//! |----------------------------|--------------------------------------------|
//! | domain                     | `p2p-secure-session/message/v1`            |
//! | version                    | `u8` = 1                                   |
//! | kind                       | `u8`: 1 handshake-init, 2 ordinary         |
//! | sent_at                    | `i64` BE seconds, `u32` BE nanoseconds     |
//! | metadata (handshake only)  | `u8` one-time flag, 32 bytes (zero if absent), signed prekey 32, ephemeral 32 |
//! | ratchet header             | dh 32, counter `u32` BE, previous length `u32` BE |
//! | ciphertext                 | `u64` BE length, bytes                     |
//! | sender key (handshake only)| 32 bytes                                   |
//!
//! Every field has a fixed width or a length prefix, so distinct messages
//! never share an encoding.

use crate::crypto::{verify_identity_signature, KeyMaterialProvider};
use crate::session::{HandshakeMetadata, RatchetPayload};
use crate::utils::{Result, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Version of the signing encoding
pub const SIGNING_ENCODING_VERSION: u8 = 1;

/// Length of message signatures
pub const SIGNATURE_LENGTH: usize = 64;

const SIGNING_DOMAIN: &[u8] = b"p2p-secure-session/message/v1";

/// The two message kinds handled by the session core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// First message of a conversation, carrying handshake metadata
    HandshakeInit,
    /// Any later message
    Ordinary,
}

impl MessageKind {
    /// Name used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeInit => "PROTOCOL_INITIALISATION",
            Self::Ordinary => "HUMAN_MESSAGE",
        }
    }

    /// Parse a wire name
    pub fn from_wire(kind: &str) -> Result<Self> {
        match kind {
            "PROTOCOL_INITIALISATION" => Ok(Self::HandshakeInit),
            "HUMAN_MESSAGE" => Ok(Self::Ordinary),
            other => Err(ValidationError::UnknownMessageKind {
                kind: other.to_string(),
            }
            .into()),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::HandshakeInit => 1,
            Self::Ordinary => 2,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific content of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Handshake initiation
    HandshakeInit {
        /// Prekeys and ephemeral key used by the initiator
        metadata: HandshakeMetadata,
        /// Initiator's Ed25519 identity public key
        sender_identity: [u8; 32],
    },
    /// Ordinary message; the sender is known from the conversation
    Ordinary,
}

impl MessageBody {
    /// Kind of this body
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::HandshakeInit { .. } => MessageKind::HandshakeInit,
            Self::Ordinary => MessageKind::Ordinary,
        }
    }
}

/// A message that has not been signed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedMessage {
    /// Creation time
    pub sent_at: DateTime<Utc>,
    /// Kind-specific content
    pub body: MessageBody,
    /// Encrypted payload
    pub ratchet: RatchetPayload,
}

impl UnsignedMessage {
    /// Sign with the identity key of `key_material`
    pub fn sign<K: KeyMaterialProvider + ?Sized>(self, key_material: &K) -> Result<Message> {
        let hash = signing_hash(&self.sent_at, &self.body, &self.ratchet);
        let signature = key_material.identity_sign(&hash)?;

        Ok(Message {
            sent_at: self.sent_at,
            body: self.body,
            ratchet: self.ratchet,
            signature,
        })
    }
}

/// A signed message. Changing any field invalidates the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Creation time
    pub sent_at: DateTime<Utc>,
    /// Kind-specific content
    pub body: MessageBody,
    /// Encrypted payload
    pub ratchet: RatchetPayload,
    /// Ed25519 signature over the signing hash
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl Message {
    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Handshake metadata, for handshake-init messages
    pub fn metadata(&self) -> Option<&HandshakeMetadata> {
        match &self.body {
            MessageBody::HandshakeInit { metadata, .. } => Some(metadata),
            MessageBody::Ordinary => None,
        }
    }

    /// Embedded sender identity key, for handshake-init messages
    pub fn sender_identity(&self) -> Option<&[u8; 32]> {
        match &self.body {
            MessageBody::HandshakeInit {
                sender_identity, ..
            } => Some(sender_identity),
            MessageBody::Ordinary => None,
        }
    }

    /// The exact bytes whose hash is signed
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_encoding(&self.sent_at, &self.body, &self.ratchet)
    }

    /// Check the signature.
    ///
    /// Handshake-init messages are checked against their embedded sender key;
    /// if `known_sender` is also given it must match. Ordinary messages need
    /// `known_sender`. Returns `Ok(false)` for a signature that does not
    /// verify and an error only when no key is available.
    pub fn verify(&self, known_sender: Option<&[u8; 32]>) -> Result<bool> {
        let signer = match (self.sender_identity(), known_sender) {
            (Some(embedded), Some(known)) if embedded != known => return Ok(false),
            (Some(embedded), _) => embedded,
            (None, Some(known)) => known,
            (None, None) => {
                return Err(ValidationError::MissingField {
                    field: "sender_identity_public_key".to_string(),
                }
                .into());
            }
        };

        let hash = signing_hash(&self.sent_at, &self.body, &self.ratchet);
        verify_identity_signature(signer, &hash, &self.signature)
    }
}

fn canonical_encoding(
    sent_at: &DateTime<Utc>,
    body: &MessageBody,
    ratchet: &RatchetPayload,
) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(256 + ratchet.ciphertext.len());
    encoded.extend_from_slice(SIGNING_DOMAIN);
    encoded.push(SIGNING_ENCODING_VERSION);
    encoded.push(body.kind().tag());
    encoded.extend_from_slice(&sent_at.timestamp().to_be_bytes());
    encoded.extend_from_slice(&sent_at.timestamp_subsec_nanos().to_be_bytes());

    if let MessageBody::HandshakeInit { metadata, .. } = body {
        match metadata.used_one_time_pre_key {
            Some(one_time) => {
                encoded.push(1);
                encoded.extend_from_slice(&one_time);
            }
            None => {
                encoded.push(0);
                encoded.extend_from_slice(&[0u8; 32]);
            }
        }
        encoded.extend_from_slice(&metadata.used_signed_pre_key);
        encoded.extend_from_slice(&metadata.ephemeral_key);
    }

    encoded.extend_from_slice(&ratchet.header.encode());
    encoded.extend_from_slice(&(ratchet.ciphertext.len() as u64).to_be_bytes());
    encoded.extend_from_slice(&ratchet.ciphertext);

    if let MessageBody::HandshakeInit {
        sender_identity, ..
    } = body
    {
        encoded.extend_from_slice(sender_identity);
    }

    encoded
}

fn signing_hash(sent_at: &DateTime<Utc>, body: &MessageBody, ratchet: &RatchetPayload) -> [u8; 32] {
    Sha256::digest(canonical_encoding(sent_at, body, ratchet)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyManager;
    use crate::session::RatchetHeader;
    use crate::utils::SessionCoreError;

    fn payload(ciphertext: &[u8]) -> RatchetPayload {
        RatchetPayload {
            header: RatchetHeader {
                dh: [4u8; 32],
                message_counter: 7,
                previous_chain_length: 0,
            },
            ciphertext: ciphertext.to_vec(),
        }
    }

    fn handshake_body(one_time: Option<[u8; 32]>, sender: [u8; 32]) -> MessageBody {
        MessageBody::HandshakeInit {
            metadata: HandshakeMetadata {
                used_one_time_pre_key: one_time,
                used_signed_pre_key: [2u8; 32],
                ephemeral_key: [3u8; 32],
            },
            sender_identity: sender,
        }
    }

    fn sign(manager: &KeyManager, body: MessageBody, ciphertext: &[u8]) -> Message {
        UnsignedMessage {
            sent_at: Utc::now(),
            body,
            ratchet: payload(ciphertext),
        }
        .sign(manager)
        .unwrap()
    }

    #[test]
    fn test_verify_sign_across_field_combinations() {
        let manager = KeyManager::generate();
        let identity = manager.identity_public_key().unwrap();

        let bodies = [
            handshake_body(Some([1u8; 32]), identity),
            handshake_body(None, identity),
            MessageBody::Ordinary,
        ];
        for body in bodies {
            for ciphertext in [&b""[..], &b"x"[..], &[0xAB; 300][..]] {
                let message = sign(&manager, body.clone(), ciphertext);
                assert!(message.verify(Some(&identity)).unwrap());
                if message.kind() == MessageKind::HandshakeInit {
                    assert!(message.verify(None).unwrap());
                }
            }
        }
    }

    #[test]
    fn test_altered_fields_fail_verification() {
        let manager = KeyManager::generate();
        let identity = manager.identity_public_key().unwrap();
        let original = sign(&manager, handshake_body(Some([1u8; 32]), identity), b"ciphertext");

        let mut alterations: Vec<Message> = Vec::new();

        let mut m = original.clone();
        m.sent_at = m.sent_at + chrono::Duration::nanoseconds(1);
        alterations.push(m);

        let mut m = original.clone();
        m.ratchet.header.message_counter += 1;
        alterations.push(m);

        let mut m = original.clone();
        m.ratchet.header.dh[0] ^= 1;
        alterations.push(m);

        let mut m = original.clone();
        m.ratchet.header.previous_chain_length = 1;
        alterations.push(m);

        let mut m = original.clone();
        m.ratchet.ciphertext[0] ^= 1;
        alterations.push(m);

        let mut m = original.clone();
        m.ratchet.ciphertext.push(0);
        alterations.push(m);

        for field in 0..3 {
            let mut m = original.clone();
            if let MessageBody::HandshakeInit { metadata, .. } = &mut m.body {
                match field {
                    0 => metadata.used_one_time_pre_key = None,
                    1 => metadata.used_signed_pre_key[5] ^= 1,
                    _ => metadata.ephemeral_key[5] ^= 1,
                }
            }
            alterations.push(m);
        }

        let mut m = original.clone();
        m.body = MessageBody::Ordinary;
        alterations.push(m);

        let mut m = original.clone();
        m.signature[10] ^= 1;
        alterations.push(m);

        for altered in alterations {
            assert!(!altered.verify(Some(&identity)).unwrap(), "{altered:?}");
        }
        assert!(original.verify(None).unwrap());
    }

    #[test]
    fn test_wrong_signer_fails() {
        let alice = KeyManager::generate();
        let mallory = KeyManager::generate();
        let alice_identity = alice.identity_public_key().unwrap();
        let mallory_identity = mallory.identity_public_key().unwrap();

        let ordinary = sign(&alice, MessageBody::Ordinary, b"hello");
        assert!(!ordinary.verify(Some(&mallory_identity)).unwrap());

        let handshake = sign(&mallory, handshake_body(None, alice_identity), b"hello");
        assert!(!handshake.verify(None).unwrap());

        let genuine = sign(&alice, handshake_body(None, alice_identity), b"hello");
        assert!(!genuine.verify(Some(&mallory_identity)).unwrap());
    }

    #[test]
    fn test_ordinary_needs_known_sender() {
        let manager = KeyManager::generate();
        let message = sign(&manager, MessageBody::Ordinary, b"hello");

        let err = message.verify(None).unwrap_err();
        assert!(matches!(
            err,
            SessionCoreError::Validation(ValidationError::MissingField { .. })
        ));
    }

    #[test]
    fn test_garbage_key_is_false() {
        let manager = KeyManager::generate();
        let message = sign(&manager, MessageBody::Ordinary, b"hello");

        let mut garbage = [0xFFu8; 32];
        garbage[31] = 0x7F;
        assert!(!message.verify(Some(&garbage)).unwrap());
    }

    #[test]
    fn test_encoding_is_deterministic_and_kind_separated() {
        let manager = KeyManager::generate();
        let identity = manager.identity_public_key().unwrap();
        let message = sign(&manager, handshake_body(None, identity), b"abc");

        assert_eq!(message.signing_bytes(), message.clone().signing_bytes());
        assert!(message.signing_bytes().starts_with(SIGNING_DOMAIN));

        let mut ordinary = message.clone();
        ordinary.body = MessageBody::Ordinary;
        assert_ne!(message.signing_bytes(), ordinary.signing_bytes());
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in [MessageKind::HandshakeInit, MessageKind::Ordinary] {
            assert_eq!(MessageKind::from_wire(kind.as_str()).unwrap(), kind);
        }
        assert!(MessageKind::from_wire("GROUP_MESSAGE").is_err());
    }
}
