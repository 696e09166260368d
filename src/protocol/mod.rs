//! Message protocol: signed messages, their wire form and the envelope
//! operations that build and open them.

pub mod envelope;
pub mod message;
pub mod wire;

pub use envelope::{MessageEnvelope, BOOTSTRAP_PLAINTEXT};
pub use message::*;
pub use wire::{WireMessage, WireRatchetHeader};
