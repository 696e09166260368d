//! Building, signing and opening messages.
//!
//! [`MessageEnvelope`] borrows its collaborators for the duration of one
//! operation and keeps no state of its own.

use crate::crypto::{KeyMaterialProvider, PreKeyBundlePrivate, PublicPreKeyBundle};
use crate::protocol::{Message, MessageBody, MessageKind, UnsignedMessage};
use crate::session::{
    Initiator, RatchetCodec, RatchetKeyAdapter, RatchetKeyStore, Responder, SharedSecret,
};
use crate::utils::{AuthenticationError, ProtocolStateError, Result};
use chrono::Utc;
use log::{debug, info, warn};

/// Plaintext encrypted into every handshake-init message
pub const BOOTSTRAP_PLAINTEXT: &[u8] = b"hi";

/// Builds and opens messages for one party
pub struct MessageEnvelope<'a, K: ?Sized, S: ?Sized> {
    key_material: &'a K,
    codec: &'a RatchetCodec,
    store: &'a S,
}

impl<'a, K, S> MessageEnvelope<'a, K, S>
where
    K: KeyMaterialProvider + ?Sized,
    S: RatchetKeyStore + ?Sized,
{
    /// Create an envelope over the local key material and ratchet store
    pub fn new(key_material: &'a K, codec: &'a RatchetCodec, store: &'a S) -> Self {
        Self {
            key_material,
            codec,
            store,
        }
    }

    /// Run the initiator handshake against `remote_bundle` and build the
    /// signed handshake-init message carrying the encrypted bootstrap
    ///
    /// # Returns
    ///
    /// Tuple of (signed message, shared secret for later messages)
    pub fn build_handshake_init(
        &self,
        remote_bundle: &PublicPreKeyBundle,
    ) -> Result<(Message, SharedSecret)> {
        let chat_key = self.key_material.chat_key_pair()?;
        let (secret, metadata) = Initiator::new(&chat_key).calculate_secret(remote_bundle)?;

        let ratchet = self.codec.encrypt(
            &secret,
            &RatchetKeyAdapter::new(&chat_key),
            self.store,
            BOOTSTRAP_PLAINTEXT,
        )?;

        let message = self.sign(UnsignedMessage {
            sent_at: Utc::now(),
            body: MessageBody::HandshakeInit {
                metadata,
                sender_identity: self.key_material.identity_public_key()?,
            },
            ratchet,
        })?;

        info!(
            "built handshake for responder {}",
            hex::encode(&remote_bundle.identity_key[..8])
        );
        Ok((message, secret))
    }

    /// Encrypt `plaintext` and build a signed ordinary message
    pub fn build_ordinary(&self, plaintext: &[u8], secret: &SharedSecret) -> Result<Message> {
        let chat_key = self.key_material.chat_key_pair()?;
        let ratchet = self.codec.encrypt(
            secret,
            &RatchetKeyAdapter::new(&chat_key),
            self.store,
            plaintext,
        )?;

        self.sign(UnsignedMessage {
            sent_at: Utc::now(),
            body: MessageBody::Ordinary,
            ratchet,
        })
    }

    /// Sign a message with the local identity key
    pub fn sign(&self, message: UnsignedMessage) -> Result<Message> {
        message.sign(self.key_material)
    }

    /// Check a message signature; see [`Message::verify`]
    pub fn verify(&self, message: &Message, known_sender: Option<&[u8; 32]>) -> Result<bool> {
        message.verify(known_sender)
    }

    /// Verify a handshake-init message and derive the shared secret.
    ///
    /// The remote chat key is taken from the ratchet header, where the
    /// initiator places it as its ratchet key.
    pub fn handle_handshake_init(
        &self,
        message: &Message,
        prekeys: &PreKeyBundlePrivate,
    ) -> Result<SharedSecret> {
        let MessageBody::HandshakeInit { metadata, .. } = &message.body else {
            return Err(ProtocolStateError::WrongMessageKind {
                expected: MessageKind::HandshakeInit,
                actual: message.kind(),
            }
            .into());
        };

        if !message.verify(None)? {
            warn!("rejected handshake with invalid signature");
            return Err(AuthenticationError::InvalidSignature.into());
        }

        let chat_key = self.key_material.chat_key_pair()?;
        let secret = Responder::new(&chat_key)
            .secret_from_metadata(&message.ratchet.header.dh, metadata, prekeys)
            .map_err(|err| {
                warn!("handshake rejected: {err}");
                err
            })?;

        info!(
            "accepted handshake from {}",
            hex::encode(&message.ratchet.header.dh[..8])
        );
        Ok(secret)
    }

    /// Verify a message and decrypt its payload
    pub fn decrypt(
        &self,
        message: &Message,
        secret: &SharedSecret,
        known_sender: Option<&[u8; 32]>,
    ) -> Result<Vec<u8>> {
        if !message.verify(known_sender)? {
            warn!(
                "rejected {} message {} with invalid signature",
                message.kind(),
                message.ratchet.header.message_counter
            );
            return Err(AuthenticationError::InvalidSignature.into());
        }

        let plaintext = self.codec.decrypt(
            secret,
            self.store,
            &message.ratchet.header,
            &message.ratchet.ciphertext,
        )?;
        debug!("opened {} message", message.kind());
        Ok(plaintext)
    }
}
