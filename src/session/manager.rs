//! Caller-owned session context.
//!
//! [`SecureSession`] bundles the collaborators one party needs and
//! serializes work per conversation: encrypt and decrypt on one conversation
//! never interleave, while different conversations run in parallel.

use crate::crypto::{KeyMaterialProvider, PreKeyStore, PublicPreKeyBundle};
use crate::protocol::{Message, MessageEnvelope, MessageKind, BOOTSTRAP_PLAINTEXT};
use crate::session::{ConversationId, RatchetCodec, RatchetKeyStore, SharedSecret};
use crate::utils::{CryptoConfig, ProtocolStateError, Result, SessionCoreError, ValidationError};
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One mutex per conversation, held only while some call uses it
#[derive(Debug, Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    /// Run `operation` while holding the lock of `conversation`
    fn with_lock<T>(&self, conversation: ConversationId, operation: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.locks.lock().entry(conversation).or_default());
        let result = {
            let _guard = lock.lock();
            operation()
        };

        // Clones are only taken under the map lock, so a count of two means
        // the map and this call are the last users.
        let mut locks = self.locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&conversation);
        }
        drop(lock);
        result
    }

    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Session context for one local party
pub struct SecureSession<K, S> {
    key_material: K,
    store: S,
    codec: RatchetCodec,
    locks: ConversationLocks,
}

impl<K, S> SecureSession<K, S>
where
    K: KeyMaterialProvider,
    S: RatchetKeyStore,
{
    /// Create a session context
    pub fn new(key_material: K, store: S, codec: RatchetCodec) -> Self {
        Self {
            key_material,
            store,
            codec,
            locks: ConversationLocks::default(),
        }
    }

    /// Create a session context with limits from configuration
    pub fn from_config(key_material: K, store: S, config: &CryptoConfig) -> Self {
        Self::new(key_material, store, RatchetCodec::new(config.max_skip))
    }

    /// The local key material
    pub fn key_material(&self) -> &K {
        &self.key_material
    }

    /// The ratchet key store
    pub fn store(&self) -> &S {
        &self.store
    }

    fn envelope(&self) -> MessageEnvelope<'_, K, S> {
        MessageEnvelope::new(&self.key_material, &self.codec, &self.store)
    }

    /// Start a conversation with the owner of `bundle`
    ///
    /// # Returns
    ///
    /// Tuple of (handshake-init message to send, shared secret)
    pub fn initiate(&self, bundle: &PublicPreKeyBundle) -> Result<(Message, SharedSecret)> {
        self.envelope()
            .build_handshake_init(bundle)
            .map_err(|e| e.with_context("initiate", hex::encode(&bundle.identity_key[..8])))
    }

    /// Accept a handshake-init message and open its bootstrap payload.
    ///
    /// The one-time prekey named by the handshake is consumed from `prekeys`
    /// only after the signature and the bootstrap payload have verified.
    pub fn accept(&self, message: &Message, prekeys: &mut PreKeyStore) -> Result<SharedSecret> {
        let peer = hex::encode(&message.ratchet.header.dh[..8]);
        let Some(metadata) = message.metadata().copied() else {
            return Err(SessionCoreError::from(ProtocolStateError::WrongMessageKind {
                expected: MessageKind::HandshakeInit,
                actual: message.kind(),
            })
            .with_context("accept", peer));
        };

        let envelope = self.envelope();
        let secret = prekeys
            .peek_private(&metadata)
            .and_then(|private| envelope.handle_handshake_init(message, &private))
            .map_err(|e| e.with_context("accept", peer.clone()))?;

        let conversation = ConversationId::from_secret(&secret)?;
        self.locks
            .with_lock(conversation, || -> Result<()> {
                let bootstrap = envelope.decrypt(message, &secret, None)?;
                if bootstrap != BOOTSTRAP_PLAINTEXT {
                    return Err(ValidationError::MalformedMessage {
                        reason: "unexpected handshake bootstrap payload".to_string(),
                    }
                    .into());
                }
                Ok(())
            })
            .map_err(|e| e.with_context("accept", conversation.to_string()))?;

        prekeys
            .consume(&metadata)
            .map_err(|e| e.with_context("accept", conversation.to_string()))?;

        info!("conversation {} established with {}", conversation, peer);
        Ok(secret)
    }

    /// Encrypt and sign an ordinary message
    pub fn send(&self, secret: &SharedSecret, plaintext: &[u8]) -> Result<Message> {
        let conversation = ConversationId::from_secret(secret)?;
        self.locks
            .with_lock(conversation, || self.envelope().build_ordinary(plaintext, secret))
            .map_err(|e| e.with_context("send", conversation.to_string()))
    }

    /// Verify and decrypt a message from `known_sender`
    pub fn receive(
        &self,
        secret: &SharedSecret,
        message: &Message,
        known_sender: Option<&[u8; 32]>,
    ) -> Result<Vec<u8>> {
        let conversation = ConversationId::from_secret(secret)?;
        self.locks
            .with_lock(conversation, || {
                self.envelope().decrypt(message, secret, known_sender)
            })
            .map_err(|e| e.with_context("receive", conversation.to_string()))
    }

    /// Number of conversations with a call currently in progress or waiting
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

impl<K, S> std::fmt::Debug for SecureSession<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("codec", &self.codec)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyManager, PreKeyStore};
    use crate::session::{FileKeyStore, MemoryKeyStore};
    use crate::utils::{AuthenticationError, ErrorKind};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn bob_bundle(bob: &SecureSession<KeyManager, MemoryKeyStore>) -> (PreKeyStore, PublicPreKeyBundle) {
        let chat = bob.key_material().chat_key_pair().unwrap();
        let mut prekeys = PreKeyStore::new();
        prekeys.generate_signed_pre_key(&chat);
        prekeys.generate_one_time_pre_keys(2);
        let bundle = prekeys.publish_bundle(&chat).unwrap();
        (prekeys, bundle)
    }

    fn established() -> (
        SecureSession<KeyManager, MemoryKeyStore>,
        SecureSession<KeyManager, MemoryKeyStore>,
        SharedSecret,
        SharedSecret,
    ) {
        let alice = SecureSession::new(KeyManager::generate(), MemoryKeyStore::new(), RatchetCodec::default());
        let bob = SecureSession::new(KeyManager::generate(), MemoryKeyStore::new(), RatchetCodec::default());
        let (mut prekeys, bundle) = bob_bundle(&bob);

        let (init, alice_secret) = alice.initiate(&bundle).unwrap();
        let bob_secret = bob.accept(&init, &mut prekeys).unwrap();
        (alice, bob, alice_secret, bob_secret)
    }

    #[test]
    fn test_send_and_receive() {
        let (alice, bob, alice_secret, bob_secret) = established();
        assert_eq!(alice_secret, bob_secret);

        let alice_identity = alice.key_material().identity_public_key().unwrap();
        let message = alice.send(&alice_secret, b"hello bob").unwrap();
        let plaintext = bob.receive(&bob_secret, &message, Some(&alice_identity)).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_errors_carry_context() {
        let (alice, bob, alice_secret, bob_secret) = established();
        let alice_identity = alice.key_material().identity_public_key().unwrap();

        let message = alice.send(&alice_secret, b"once").unwrap();
        bob.receive(&bob_secret, &message, Some(&alice_identity)).unwrap();
        let err = bob
            .receive(&bob_secret, &message, Some(&alice_identity))
            .unwrap_err();

        assert!(matches!(err, SessionCoreError::Context { operation: "receive", .. }));
        assert!(matches!(
            err.root(),
            SessionCoreError::Authentication(AuthenticationError::KeyNotFound { .. })
        ));
        assert!(err.is_security_violation());
        assert!(!err.to_string().contains(&hex::encode(bob_secret.as_bytes())));

        let mut tampered = alice.send(&alice_secret, b"x").unwrap();
        tampered.signature[0] ^= 1;
        let err = bob
            .receive(&bob_secret, &tampered, Some(&alice_identity))
            .unwrap_err();
        assert!(matches!(
            err.root(),
            SessionCoreError::Authentication(AuthenticationError::InvalidSignature)
        ));
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_concurrent_sends_use_distinct_counters() {
        let (alice, bob, alice_secret, bob_secret) = established();
        let alice_identity = alice.key_material().identity_public_key().unwrap();

        let messages: Vec<Message> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|thread| {
                    let alice = &alice;
                    let secret = &alice_secret;
                    scope.spawn(move || {
                        (0..10)
                            .map(|i| alice.send(secret, format!("{thread}-{i}").as_bytes()).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let counters: HashSet<u32> = messages
            .iter()
            .map(|m| m.ratchet.header.message_counter)
            .collect();
        assert_eq!(counters.len(), 80);

        std::thread::scope(|scope| {
            for chunk in messages.chunks(20) {
                let bob = &bob;
                let secret = &bob_secret;
                let sender = &alice_identity;
                scope.spawn(move || {
                    for message in chunk {
                        bob.receive(secret, message, Some(sender)).unwrap();
                    }
                });
            }
        });
        assert_eq!(bob.store().message_key_count(), 0);
        assert_eq!(alice.active_locks(), 0);
        assert_eq!(bob.active_locks(), 0);
    }

    #[test]
    fn test_independent_conversations() {
        let (alice, bob, alice_secret, bob_secret) = established();
        let (carol, dave, carol_secret, dave_secret) = established();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let sender = alice.key_material().identity_public_key().unwrap();
                for i in 0..20 {
                    let m = alice.send(&alice_secret, &[i]).unwrap();
                    assert_eq!(bob.receive(&bob_secret, &m, Some(&sender)).unwrap(), vec![i]);
                }
            });
            scope.spawn(|| {
                let sender = carol.key_material().identity_public_key().unwrap();
                for i in 0..20 {
                    let m = carol.send(&carol_secret, &[i]).unwrap();
                    assert_eq!(dave.receive(&dave_secret, &m, Some(&sender)).unwrap(), vec![i]);
                }
            });
        });
    }

    #[test]
    fn test_restart_with_file_store() {
        let dir = TempDir::new().unwrap();
        let alice_keys = Arc::new(KeyManager::generate());
        let bob_keys = Arc::new(KeyManager::generate());
        let bob_chat = bob_keys.chat_key_pair().unwrap();

        let mut prekeys = PreKeyStore::new();
        prekeys.generate_signed_pre_key(&bob_chat);
        let bundle = prekeys.publish_bundle(&bob_chat).unwrap();

        let open = |name: &str| FileKeyStore::open(dir.path().join(name)).unwrap();

        let (init, alice_secret, first) = {
            let alice = SecureSession::new(Arc::clone(&alice_keys), open("alice.bin"), RatchetCodec::default());
            let (init, secret) = alice.initiate(&bundle).unwrap();
            let first = alice.send(&secret, b"before restart").unwrap();
            (init, secret, first)
        };

        let bob_secret = {
            let bob = SecureSession::new(Arc::clone(&bob_keys), open("bob.bin"), RatchetCodec::default());
            bob.accept(&init, &mut prekeys).unwrap()
        };

        let alice = SecureSession::new(Arc::clone(&alice_keys), open("alice.bin"), RatchetCodec::default());
        let second = alice.send(&alice_secret, b"after restart").unwrap();
        assert_eq!(second.ratchet.header.message_counter, 2);

        let sender = alice_keys.identity_public_key().unwrap();
        let bob = SecureSession::new(Arc::clone(&bob_keys), open("bob.bin"), RatchetCodec::default());
        assert_eq!(bob.receive(&bob_secret, &second, Some(&sender)).unwrap(), b"after restart");

        let bob = SecureSession::new(Arc::clone(&bob_keys), open("bob.bin"), RatchetCodec::default());
        assert_eq!(bob.receive(&bob_secret, &first, Some(&sender)).unwrap(), b"before restart");
        assert_eq!(bob.store().message_key_count(), 0);
    }

    #[test]
    fn test_locked_key_manager_on_send() {
        let (alice, _bob, alice_secret, _) = established();
        alice.key_material().lock();

        let err = alice.send(&alice_secret, b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert!(err.is_recoverable());

        alice.key_material().unlock();
        assert!(alice.send(&alice_secret, b"x").is_ok());
    }

    #[test]
    fn test_replies_move_to_fresh_ratchet_keys() {
        let (alice, bob, alice_secret, bob_secret) = established();
        let alice_identity = alice.key_material().identity_public_key().unwrap();
        let bob_identity = bob.key_material().identity_public_key().unwrap();
        let alice_chat = alice.key_material().chat_key_pair().unwrap().public_key();

        let mut seen = HashSet::new();
        for round in 0..3u8 {
            let message = alice.send(&alice_secret, &[round]).unwrap();
            assert_eq!(bob.receive(&bob_secret, &message, Some(&alice_identity)).unwrap(), vec![round]);
            seen.insert(message.ratchet.header.dh);

            let reply = bob.send(&bob_secret, &[round, 1]).unwrap();
            assert_eq!(alice.receive(&alice_secret, &reply, Some(&bob_identity)).unwrap(), vec![round, 1]);
            seen.insert(reply.ratchet.header.dh);
        }

        assert_eq!(seen.len(), 6);
        assert!(seen.contains(&alice_chat));
    }

    #[test]
    fn test_forged_handshake_keeps_one_time_prekey() {
        let alice = SecureSession::new(KeyManager::generate(), MemoryKeyStore::new(), RatchetCodec::default());
        let bob = SecureSession::new(KeyManager::generate(), MemoryKeyStore::new(), RatchetCodec::default());
        let (mut prekeys, bundle) = bob_bundle(&bob);
        assert!(bundle.one_time_pre_key.is_some());

        let (init, alice_secret) = alice.initiate(&bundle).unwrap();
        let mut forged = init.clone();
        forged.signature[10] ^= 0x01;

        let err = bob.accept(&forged, &mut prekeys).unwrap_err();
        assert!(matches!(
            err.root(),
            SessionCoreError::Authentication(AuthenticationError::InvalidSignature)
        ));
        assert_eq!(bob.store().state_count(), 0);

        let bob_secret = bob.accept(&init, &mut prekeys).unwrap();
        assert_eq!(bob_secret, alice_secret);

        let err = bob.accept(&init, &mut prekeys).unwrap_err();
        assert!(matches!(
            err.root(),
            SessionCoreError::ProtocolState(crate::utils::ProtocolStateError::MissingPreKey { .. })
        ));
    }

    #[test]
    fn test_accept_rejects_ordinary_message() {
        let (alice, bob, alice_secret, _) = established();
        let (mut prekeys, _) = bob_bundle(&bob);
        let ordinary = alice.send(&alice_secret, b"not a handshake").unwrap();

        let err = bob.accept(&ordinary, &mut prekeys).unwrap_err();
        assert!(matches!(err, SessionCoreError::Context { operation: "accept", .. }));
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
    }

    #[test]
    fn test_locks_are_released_after_use() {
        let (alice, bob, alice_secret, bob_secret) = established();
        let alice_identity = alice.key_material().identity_public_key().unwrap();
        assert_eq!(bob.active_locks(), 0);

        for i in 0..5u8 {
            let message = alice.send(&alice_secret, &[i]).unwrap();
            bob.receive(&bob_secret, &message, Some(&alice_identity)).unwrap();
        }
        let message = alice.send(&alice_secret, b"x").unwrap();
        let mut tampered = message.clone();
        tampered.signature[0] ^= 1;
        assert!(bob.receive(&bob_secret, &tampered, Some(&alice_identity)).is_err());

        assert_eq!(alice.active_locks(), 0);
        assert_eq!(bob.active_locks(), 0);
    }
}
