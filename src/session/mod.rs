//! Session establishment and per-message encryption.
//!
//! This module provides the session layer: the X3DH-style key agreement, the
//! stateless ratchet codec with its pluggable key store, and the caller-owned
//! [`SecureSession`] context that serializes work per conversation.

pub mod adapter;
pub mod manager;
pub mod ratchet;
pub mod store;
pub mod x3dh;

pub use adapter::{RatchetKeyAdapter, RatchetKeyPair, RATCHET_KEY_LENGTH};
pub use manager::SecureSession;
pub use ratchet::*;
pub use store::*;
pub use x3dh::*;
