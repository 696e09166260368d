//! Cryptographic primitives and identity management.
//!
//! This module provides the long-term key material, XEdDSA signatures for
//! signed prekeys, prekey bundles and identity-signed profiles.

pub(crate) mod kdf;

pub mod identity;
pub mod prekeys;
pub mod profile;
pub mod xeddsa;

pub use identity::*;
pub use prekeys::*;
pub use profile::*;
