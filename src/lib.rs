//! # P2P Secure Session
//!
//! Session core for end-to-end encrypted peer-to-peer messaging: X3DH key
//! agreement, a Double Ratchet whose state lives entirely in an external key
//! store, and signed message envelopes.
//!
//! ## Features
//!
//! - **Key Agreement**: X3DH over X25519 with signed and one-time prekeys
//! - **Stateless Ratchet**: conversation state is rebuilt from the key store on every call
//! - **Signed Envelopes**: every message is signed by the sender's Ed25519 identity
//! - **Identity Management**: lockable key manager and identity-signed profiles
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use p2p_secure_session::crypto::{KeyMaterialProvider, PreKeyStore};
//! use p2p_secure_session::session::{MemoryKeyStore, RatchetCodec};
//! use p2p_secure_session::{KeyManager, SecureSession};
//!
//! fn main() -> p2p_secure_session::Result<()> {
//!     let alice = SecureSession::new(KeyManager::generate(), MemoryKeyStore::new(), RatchetCodec::default());
//!     let bob = SecureSession::new(KeyManager::generate(), MemoryKeyStore::new(), RatchetCodec::default());
//!
//!     let bob_chat = bob.key_material().chat_key_pair()?;
//!     let mut prekeys = PreKeyStore::new();
//!     prekeys.generate_signed_pre_key(&bob_chat);
//!     let bundle = prekeys.publish_bundle(&bob_chat)?;
//!
//!     let (init, alice_secret) = alice.initiate(&bundle)?;
//!     let bob_secret = bob.accept(&init, &mut prekeys)?;
//!
//!     let message = alice.send(&alice_secret, b"hello")?;
//!     let sender = alice.key_material().identity_public_key()?;
//!     let plaintext = bob.receive(&bob_secret, &message, Some(&sender))?;
//!     assert_eq!(plaintext, b"hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity and chat keys, prekeys, XEdDSA and profiles
//! - [`session`]: X3DH, the ratchet codec, key stores and [`SecureSession`]
//! - [`protocol`]: message types, signing and the JSON wire format
//! - [`utils`]: configuration, error handling and logging

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod protocol;
pub mod session;
pub mod utils;

pub use crypto::{KeyManager, KeyMaterialProvider, PreKeyStore, PublicPreKeyBundle};
pub use protocol::{Message, MessageEnvelope, MessageKind};
pub use session::{RatchetCodec, RatchetKeyStore, SecureSession, SharedSecret};
pub use utils::{Result, SessionConfig, SessionCoreError};

/// Version information for the session protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum serialized message size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default bound on message keys skipped per chain for one incoming message
    pub const DEFAULT_MAX_SKIP: u32 = 1000;

    /// Default file name of the ratchet key store inside the data directory
    pub const DEFAULT_RATCHET_STORE_FILE: &str = "ratchet-store.bin";
}
