//! Double Ratchet encryption with externally persisted state.
//!
//! [`RatchetCodec`] holds no conversation state. Every call rebuilds the
//! conversation's [`RatchetChainState`] from a [`RatchetKeyStore`], performs
//! one step and writes the result back, so a process restart between two
//! messages loses nothing.
//!
//! The root key starts from the shared secret. The initiator's chat key is its
//! first ratchet key; every later ratchet key is generated fresh. Each time a
//! party sends after receiving a new remote ratchet key it generates a new key
//! pair and mixes a Diffie-Hellman output into the root key, so a stolen chain
//! key stops working after one round trip:
//!
//! ```text
//! root_key[0]                  = HKDF(ikm = shared_secret)
//! first chain_key              = HKDF(salt = root_key[0], ikm = initiator_chat_key)
//! root_key[n+1] || chain_key   = HKDF(salt = root_key[n], ikm = DH(local, remote))
//! chain_key[i+1] || mk[i]      = HKDF(ikm = chain_key[i])
//! ```
//!
//! Message keys encrypt with ChaCha20-Poly1305; the encoded header is the
//! associated data, so any change to it fails authentication.

use crate::crypto::kdf::hkdf_sha256;
use crate::session::adapter::validate_key_pair;
use crate::session::{RatchetKeyPair, RatchetKeyStore, SharedSecret};
use crate::utils::{AuthenticationError, ProtocolStateError, Result, ValidationError};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use log::{debug, warn};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of root, chain and message keys
pub const MESSAGE_KEY_LENGTH: usize = 32;

/// Length of the encoded ratchet header
pub const HEADER_LENGTH: usize = 40;

const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

const CONVERSATION_ID_INFO: &[u8] = b"p2p-secure-session/ratchet/conversation-id/v1";
const ROOT_INFO: &[u8] = b"p2p-secure-session/ratchet/root/v1";
const INITIAL_CHAIN_INFO: &[u8] = b"p2p-secure-session/ratchet/initial-chain/v1";
const ROOT_STEP_INFO: &[u8] = b"p2p-secure-session/ratchet/root-step/v1";
const CHAIN_KEY_INFO: &[u8] = b"p2p-secure-session/ratchet/chain-step/v1";

/// A single-use symmetric message key
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct MessageKey([u8; MESSAGE_KEY_LENGTH]);

impl MessageKey {
    /// Wrap exactly 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; MESSAGE_KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| ValidationError::InvalidKeyLength {
                    what: "message key",
                    expected: MESSAGE_KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// The raw key bytes
    pub fn as_bytes(&self) -> &[u8; MESSAGE_KEY_LENGTH] {
        &self.0
    }
}

impl PartialEq for MessageKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for MessageKey {}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageKey([REDACTED])")
    }
}

/// Header sent in the clear with every ratchet message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub dh: [u8; 32],
    /// Position of this message in the sender's chain
    pub message_counter: u32,
    /// Number of messages the sender sent on its previous chain
    pub previous_chain_length: u32,
}

impl RatchetHeader {
    /// Fixed encoding: `dh || counter (u32 BE) || previous_chain_length (u32 BE)`
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut encoded = [0u8; HEADER_LENGTH];
        encoded[..32].copy_from_slice(&self.dh);
        encoded[32..36].copy_from_slice(&self.message_counter.to_be_bytes());
        encoded[36..].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        encoded
    }
}

/// Header plus ciphertext, as embedded in a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetPayload {
    /// Ratchet header (authenticated as associated data)
    pub header: RatchetHeader,
    /// Nonce followed by the AEAD ciphertext and tag
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Public identifier of one conversation, derived one-way from its shared secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId([u8; 8]);

impl ConversationId {
    /// Fingerprint the conversation that uses `secret`
    pub fn from_secret(secret: &SharedSecret) -> Result<Self> {
        Ok(Self(hkdf_sha256(None, secret.as_bytes(), CONVERSATION_ID_INFO)?))
    }

    /// The raw fingerprint
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conv:{}", hex::encode(self.0))
    }
}

/// Address of one cached message key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKeyId {
    /// Conversation the key belongs to
    pub conversation: ConversationId,
    /// Sender ratchet public key of the chain the key was derived on
    pub ratchet_key: [u8; 32],
    /// Message counter within that chain
    pub counter: u32,
}

impl MessageKeyId {
    /// Address the key for `counter` on the chain of `ratchet_key`
    pub fn new(conversation: ConversationId, ratchet_key: [u8; 32], counter: u32) -> Self {
        Self {
            conversation,
            ratchet_key,
            counter,
        }
    }
}

/// Position of one symmetric chain
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ChainState {
    ratchet_key: [u8; 32],
    chain_key: [u8; MESSAGE_KEY_LENGTH],
    next_counter: u32,
}

impl ChainState {
    fn initial(root_key: &[u8; MESSAGE_KEY_LENGTH], ratchet_key: [u8; 32]) -> Result<Self> {
        Ok(Self {
            ratchet_key,
            chain_key: hkdf_sha256(Some(root_key.as_slice()), &ratchet_key, INITIAL_CHAIN_INFO)?,
            next_counter: 0,
        })
    }

    /// Ratchet public key that names this chain in message headers
    pub fn ratchet_key(&self) -> &[u8; 32] {
        &self.ratchet_key
    }

    /// Counter of the next message this chain will produce or expects
    pub fn next_counter(&self) -> u32 {
        self.next_counter
    }

    /// Derive the message key for `next_counter` and advance
    fn step(&mut self) -> Result<MessageKey> {
        let mut output: [u8; MESSAGE_KEY_LENGTH * 2] =
            hkdf_sha256(None, &self.chain_key, CHAIN_KEY_INFO)?;

        self.chain_key.copy_from_slice(&output[..MESSAGE_KEY_LENGTH]);
        let message_key = MessageKey::from_bytes(&output[MESSAGE_KEY_LENGTH..]);
        output.zeroize();

        self.next_counter = self
            .next_counter
            .checked_add(1)
            .ok_or(ProtocolStateError::ChainExhausted)?;
        message_key
    }

    /// Derive the keys of every counter before `until` for later messages
    fn skip_to(
        &mut self,
        conversation: ConversationId,
        until: u32,
        skipped: &mut Vec<(MessageKeyId, MessageKey)>,
    ) -> Result<()> {
        while self.next_counter < until {
            let id = MessageKeyId::new(conversation, self.ratchet_key, self.next_counter);
            skipped.push((id, self.step()?));
        }
        Ok(())
    }
}

impl fmt::Debug for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainState")
            .field("ratchet_key", &hex::encode(&self.ratchet_key[..4]))
            .field("chain_key", &"[REDACTED]")
            .field("next_counter", &self.next_counter)
            .finish()
    }
}

/// Persisted ratchet state of one conversation
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct RatchetChainState {
    root_key: [u8; MESSAGE_KEY_LENGTH],
    local_private: Option<[u8; 32]>,
    sending: Option<ChainState>,
    receiving: Option<ChainState>,
    previous_chain_length: u32,
    #[zeroize(skip)]
    needs_send_ratchet: bool,
}

impl RatchetChainState {
    fn new(secret: &SharedSecret) -> Result<Self> {
        Ok(Self {
            root_key: hkdf_sha256(None, secret.as_bytes(), ROOT_INFO)?,
            local_private: None,
            sending: None,
            receiving: None,
            previous_chain_length: 0,
            needs_send_ratchet: false,
        })
    }

    /// Current sending chain, if this party has sent on it
    pub fn sending(&self) -> Option<&ChainState> {
        self.sending.as_ref()
    }

    /// Current receiving chain, if this party has received on it
    pub fn receiving(&self) -> Option<&ChainState> {
        self.receiving.as_ref()
    }

    /// The remote ratchet key the receiving chain belongs to
    pub fn remote_ratchet_key(&self) -> Option<&[u8; 32]> {
        self.receiving.as_ref().map(ChainState::ratchet_key)
    }

    fn root_step(&mut self, dh_output: &[u8; 32], ratchet_key: [u8; 32]) -> Result<ChainState> {
        let mut output: [u8; MESSAGE_KEY_LENGTH * 2] =
            hkdf_sha256(Some(self.root_key.as_slice()), dh_output, ROOT_STEP_INFO)?;

        self.root_key.copy_from_slice(&output[..MESSAGE_KEY_LENGTH]);
        let mut chain_key = [0u8; MESSAGE_KEY_LENGTH];
        chain_key.copy_from_slice(&output[MESSAGE_KEY_LENGTH..]);
        output.zeroize();

        Ok(ChainState {
            ratchet_key,
            chain_key,
            next_counter: 0,
        })
    }

    /// Start a new sending chain under a freshly generated ratchet key
    fn ratchet_sending(&mut self) -> Result<()> {
        let Some(remote) = self.remote_ratchet_key().copied() else {
            return Ok(());
        };

        let fresh = StaticSecret::random_from_rng(OsRng);
        let dh_output = agree(&fresh, &remote).ok_or_else(|| ValidationError::MalformedMessage {
            reason: "remote ratchet key is a low-order point".to_string(),
        })?;

        self.previous_chain_length = self.sending.as_ref().map_or(0, ChainState::next_counter);
        self.sending = Some(self.root_step(dh_output.as_bytes(), PublicKey::from(&fresh).to_bytes())?);
        self.local_private = Some(fresh.to_bytes());
        self.needs_send_ratchet = false;
        Ok(())
    }

    /// Switch the receiving chain to the new remote ratchet key in `header`.
    ///
    /// Keys left on the old receiving chain up to `previous_chain_length` are
    /// pushed to `skipped`. A party that has never sent starts from the
    /// initiator's first chain instead of a Diffie-Hellman step.
    fn ratchet_receiving(
        &mut self,
        conversation: ConversationId,
        header: &RatchetHeader,
        skipped: &mut Vec<(MessageKeyId, MessageKey)>,
    ) -> Result<()> {
        let chain = match self.local_private.as_ref() {
            None if self.receiving.is_none() => ChainState::initial(&self.root_key, header.dh)?,
            None => return Err(AuthenticationError::DecryptionFailed.into()),
            Some(local_private) => {
                let dh_output = agree(&StaticSecret::from(*local_private), &header.dh)
                    .ok_or(AuthenticationError::DecryptionFailed)?;
                if let Some(old) = self.receiving.as_mut() {
                    old.skip_to(conversation, header.previous_chain_length, skipped)?;
                }
                self.root_step(dh_output.as_bytes(), header.dh)?
            }
        };

        self.receiving = Some(chain);
        self.needs_send_ratchet = true;
        Ok(())
    }
}

impl fmt::Debug for RatchetChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetChainState")
            .field("root_key", &"[REDACTED]")
            .field("sending", &self.sending)
            .field("receiving", &self.receiving)
            .field("previous_chain_length", &self.previous_chain_length)
            .field("needs_send_ratchet", &self.needs_send_ratchet)
            .finish()
    }
}

fn agree(local: &StaticSecret, remote: &[u8; 32]) -> Option<x25519_dalek::SharedSecret> {
    let output = local.diffie_hellman(&PublicKey::from(*remote));
    output.was_contributory().then_some(output)
}

/// Stateless encrypt/decrypt over a [`RatchetKeyStore`]
#[derive(Debug, Clone, Copy)]
pub struct RatchetCodec {
    max_skip: u32,
}

impl RatchetCodec {
    /// Create a codec that derives at most `max_skip` keys ahead per chain
    pub fn new(max_skip: u32) -> Self {
        Self { max_skip }
    }

    /// Maximum number of skipped message keys derived per chain for one message
    pub fn max_skip(&self) -> u32 {
        self.max_skip
    }

    /// Encrypt one message for the conversation of `secret`
    ///
    /// # Arguments
    ///
    /// * `secret` - Shared secret of the conversation
    /// * `local_key_pair` - Chat key pair; becomes the first ratchet key if
    ///   this party opens the conversation
    /// * `store` - Key store holding the conversation state
    /// * `plaintext` - Message to encrypt
    pub fn encrypt<K, S>(
        &self,
        secret: &SharedSecret,
        local_key_pair: &K,
        store: &S,
        plaintext: &[u8],
    ) -> Result<RatchetPayload>
    where
        K: RatchetKeyPair + ?Sized,
        S: RatchetKeyStore + ?Sized,
    {
        validate_key_pair(local_key_pair)?;

        let conversation = ConversationId::from_secret(secret)?;
        let mut state = match store.load_state(&conversation)? {
            Some(state) => state,
            None => RatchetChainState::new(secret)?,
        };

        if state.needs_send_ratchet {
            state.ratchet_sending()?;
            debug!("new sending chain for {}", conversation);
        }

        let sending = match &mut state.sending {
            Some(chain) => chain,
            empty @ None => {
                let ratchet_key = local_key_pair.public_key();
                state.local_private = Some(local_key_pair.private_key());
                empty.insert(ChainState::initial(&state.root_key, ratchet_key)?)
            }
        };

        let header = RatchetHeader {
            dh: sending.ratchet_key,
            message_counter: sending.next_counter,
            previous_chain_length: state.previous_chain_length,
        };
        let message_key = sending.step()?;
        let ciphertext = seal(&message_key, &header, plaintext)?;

        store.save_state(&conversation, &state)?;
        debug!(
            "encrypted message {} for {}",
            header.message_counter, conversation
        );

        Ok(RatchetPayload { header, ciphertext })
    }

    /// Decrypt one message of the conversation of `secret`.
    ///
    /// Counters behind a chain are served from skipped keys in the store and
    /// the key is deleted after use. Counters ahead derive and store the keys
    /// in between. A new remote ratchet key advances the root key. Nothing is
    /// persisted unless authentication succeeds.
    pub fn decrypt<S>(
        &self,
        secret: &SharedSecret,
        store: &S,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>
    where
        S: RatchetKeyStore + ?Sized,
    {
        if ciphertext.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(AuthenticationError::DecryptionFailed.into());
        }

        let conversation = ConversationId::from_secret(secret)?;
        let key_id = MessageKeyId::new(conversation, header.dh, header.message_counter);
        if let Some(message_key) = store.get(&key_id)? {
            let plaintext = open(&message_key, header, ciphertext)?;
            store.delete(&key_id)?;
            debug!(
                "decrypted skipped message {} for {}",
                header.message_counter, conversation
            );
            return Ok(plaintext);
        }

        let mut state = match store.load_state(&conversation)? {
            Some(state) => state,
            None => RatchetChainState::new(secret)?,
        };
        let mut skipped = Vec::new();

        if state.remote_ratchet_key() == Some(&header.dh) {
            let next_counter = state.receiving.as_ref().map_or(0, ChainState::next_counter);
            if header.message_counter < next_counter {
                warn!(
                    "no key for message {} on {}; replayed or forged counter",
                    header.message_counter, conversation
                );
                return Err(AuthenticationError::KeyNotFound {
                    ratchet_key: hex::encode(header.dh),
                    counter: header.message_counter,
                }
                .into());
            }
            self.check_skip(&conversation, header.message_counter - next_counter)?;
        } else {
            if let Some(old) = state.receiving.as_ref() {
                let old_skip = header.previous_chain_length.saturating_sub(old.next_counter);
                self.check_skip(&conversation, old_skip)?;
            }
            self.check_skip(&conversation, header.message_counter)?;
            state.ratchet_receiving(conversation, header, &mut skipped)?;
        }

        let receiving = state
            .receiving
            .as_mut()
            .ok_or(AuthenticationError::DecryptionFailed)?;
        receiving.skip_to(conversation, header.message_counter, &mut skipped)?;
        let message_key = receiving.step()?;
        let plaintext = open(&message_key, header, ciphertext)?;

        let skipped_count = skipped.len();
        if !skipped.is_empty() {
            store.put_many(skipped)?;
        }
        store.save_state(&conversation, &state)?;
        debug!(
            "decrypted message {} for {} ({} keys skipped)",
            header.message_counter, conversation, skipped_count
        );

        Ok(plaintext)
    }

    fn check_skip(&self, conversation: &ConversationId, skip: u32) -> Result<()> {
        if skip > self.max_skip {
            warn!(
                "message for {} skips {} keys (limit {})",
                conversation, skip, self.max_skip
            );
            return Err(AuthenticationError::TooManySkippedMessages {
                requested: skip,
                limit: self.max_skip,
            }
            .into());
        }
        Ok(())
    }
}

impl Default for RatchetCodec {
    fn default() -> Self {
        Self::new(crate::defaults::DEFAULT_MAX_SKIP)
    }
}

fn seal(message_key: &MessageKey, header: &RatchetHeader, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(message_key.as_bytes()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let associated_data = header.encode();

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &associated_data,
            },
        )
        .map_err(|_| ValidationError::MalformedMessage {
            reason: "plaintext too long to encrypt".to_string(),
        })?;

    let mut result = nonce.to_vec();
    result.append(&mut ciphertext);
    Ok(result)
}

fn open(message_key: &MessageKey, header: &RatchetHeader, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(AuthenticationError::DecryptionFailed.into());
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(message_key.as_bytes()));
    let nonce = Nonce::from_slice(&ciphertext[..NONCE_LENGTH]);
    let associated_data = header.encode();

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext[NONCE_LENGTH..],
                aad: &associated_data,
            },
        )
        .map_err(|_| {
            warn!("authentication failed for message {}", header.message_counter);
            AuthenticationError::DecryptionFailed.into()
        })
}
