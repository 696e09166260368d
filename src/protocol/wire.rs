//! JSON wire form of [`Message`].
//!
//! Keys travel as hex, ciphertext and signatures as base64. Handshake
//! metadata is a string map with the keys `used_one_time_pre_key`,
//! `used_signed_pre_key` and `ephemeral_key`. Parsing is strict: each kind
//! has a closed set of fields, and anything missing, unknown or malformed is
//! rejected before a [`Message`] exists.

use crate::protocol::{Message, MessageBody, MessageKind, SIGNATURE_LENGTH};
use crate::session::{HandshakeMetadata, RatchetHeader, RatchetPayload};
use crate::utils::{Result, ValidationError};
use crate::MAX_MESSAGE_SIZE;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key naming the consumed one-time prekey
pub const USED_ONE_TIME_PRE_KEY: &str = "used_one_time_pre_key";
/// Metadata key naming the signed prekey
pub const USED_SIGNED_PRE_KEY: &str = "used_signed_pre_key";
/// Metadata key carrying the initiator's ephemeral key
pub const EPHEMERAL_KEY: &str = "ephemeral_key";

/// Ratchet header as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireRatchetHeader {
    /// Sender ratchet key (hex)
    pub dh: String,
    /// Message counter
    pub message_counter: u32,
    /// Previous chain length
    pub previous_chain_length: u32,
}

/// Message as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireMessage {
    /// `PROTOCOL_INITIALISATION` or `HUMAN_MESSAGE`
    pub kind: String,
    /// Creation time
    pub sent_at: DateTime<Utc>,
    /// Handshake metadata (hex values)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    /// Ratchet header
    pub ratchet_header: WireRatchetHeader,
    /// Nonce, ciphertext and tag (base64)
    pub ciphertext: String,
    /// Sender identity key (hex), handshake-init only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_identity_public_key: Option<String>,
    /// Signature (base64)
    pub signature: String,
}

impl WireMessage {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parse JSON, refusing oversized input
    pub fn from_json(json: &str) -> Result<Self> {
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::MalformedMessage {
                reason: format!("message of {} bytes exceeds {MAX_MESSAGE_SIZE}", json.len()),
            }
            .into());
        }
        serde_json::from_str(json).map_err(Into::into)
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let (metadata, sender_identity_public_key) = match &message.body {
            MessageBody::HandshakeInit {
                metadata,
                sender_identity,
            } => {
                let mut map = BTreeMap::new();
                if let Some(one_time) = metadata.used_one_time_pre_key {
                    map.insert(USED_ONE_TIME_PRE_KEY.to_string(), hex::encode(one_time));
                }
                map.insert(
                    USED_SIGNED_PRE_KEY.to_string(),
                    hex::encode(metadata.used_signed_pre_key),
                );
                map.insert(EPHEMERAL_KEY.to_string(), hex::encode(metadata.ephemeral_key));
                (Some(map), Some(hex::encode(sender_identity)))
            }
            MessageBody::Ordinary => (None, None),
        };

        Self {
            kind: message.kind().as_str().to_string(),
            sent_at: message.sent_at,
            metadata,
            ratchet_header: WireRatchetHeader {
                dh: hex::encode(message.ratchet.header.dh),
                message_counter: message.ratchet.header.message_counter,
                previous_chain_length: message.ratchet.header.previous_chain_length,
            },
            ciphertext: STANDARD.encode(&message.ratchet.ciphertext),
            sender_identity_public_key,
            signature: STANDARD.encode(message.signature),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = crate::utils::SessionCoreError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let kind = MessageKind::from_wire(&wire.kind)?;

        let body = match kind {
            MessageKind::HandshakeInit => {
                let metadata = wire.metadata.ok_or_else(|| ValidationError::MissingField {
                    field: "metadata".to_string(),
                })?;
                let sender = wire.sender_identity_public_key.ok_or_else(|| {
                    ValidationError::MissingField {
                        field: "sender_identity_public_key".to_string(),
                    }
                })?;

                MessageBody::HandshakeInit {
                    metadata: parse_metadata(&metadata)?,
                    sender_identity: decode_hex_key("sender_identity_public_key", &sender)?,
                }
            }
            MessageKind::Ordinary => {
                if wire.metadata.is_some() || wire.sender_identity_public_key.is_some() {
                    return Err(ValidationError::MalformedMessage {
                        reason: "ordinary messages carry no handshake fields".to_string(),
                    }
                    .into());
                }
                MessageBody::Ordinary
            }
        };

        let ciphertext = decode_base64("ciphertext", &wire.ciphertext)?;
        let signature_bytes = decode_base64("signature", &wire.signature)?;
        let signature: [u8; SIGNATURE_LENGTH] =
            signature_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "signature",
                    expected: SIGNATURE_LENGTH,
                    actual: signature_bytes.len(),
                })?;

        Ok(Message {
            sent_at: wire.sent_at,
            body,
            ratchet: RatchetPayload {
                header: RatchetHeader {
                    dh: decode_hex_key("ratchet_header.dh", &wire.ratchet_header.dh)?,
                    message_counter: wire.ratchet_header.message_counter,
                    previous_chain_length: wire.ratchet_header.previous_chain_length,
                },
                ciphertext,
            },
            signature,
        })
    }
}

impl Message {
    /// Serialize to the JSON wire form
    pub fn to_wire_json(&self) -> Result<String> {
        WireMessage::from(self).to_json()
    }

    /// Parse and validate the JSON wire form
    pub fn from_wire_json(json: &str) -> Result<Self> {
        Message::try_from(WireMessage::from_json(json)?)
    }
}

fn parse_metadata(metadata: &BTreeMap<String, String>) -> Result<HandshakeMetadata> {
    if let Some(unknown) = metadata
        .keys()
        .find(|key| ![USED_ONE_TIME_PRE_KEY, USED_SIGNED_PRE_KEY, EPHEMERAL_KEY].contains(&key.as_str()))
    {
        return Err(ValidationError::MalformedMessage {
            reason: format!("unknown metadata field {unknown}"),
        }
        .into());
    }

    let required = |field: &'static str| -> Result<[u8; 32]> {
        let value = metadata
            .get(field)
            .ok_or(ValidationError::MissingMetadataField { field })?;
        decode_hex_key(field, value)
    };

    let used_one_time_pre_key = match metadata.get(USED_ONE_TIME_PRE_KEY) {
        Some(value) if !value.is_empty() => Some(decode_hex_key(USED_ONE_TIME_PRE_KEY, value)?),
        _ => None,
    };

    Ok(HandshakeMetadata {
        used_one_time_pre_key,
        used_signed_pre_key: required(USED_SIGNED_PRE_KEY)?,
        ephemeral_key: required(EPHEMERAL_KEY)?,
    })
}

fn decode_hex_key(field: &'static str, value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).map_err(|e| ValidationError::InvalidHex {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    let length = bytes.len();
    bytes.try_into().map_err(|_| {
        ValidationError::InvalidKeyLength {
            what: field,
            expected: 32,
            actual: length,
        }
        .into()
    })
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD.decode(value).map_err(|e| {
        ValidationError::InvalidBase64 {
            field: field.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
