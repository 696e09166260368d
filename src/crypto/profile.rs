//! Identity-signed user profiles.
//!
//! A profile tells peers which chat key belongs to which identity key. The
//! identity key signs the SHA-256 hash of a fixed, length-prefixed encoding
//! of every information field.

use crate::crypto::{verify_identity_signature, KeyMaterialProvider};
use crate::utils::{Result, ValidationError};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current profile format version
pub const PROFILE_VERSION: u16 = 1;

const PROFILE_DOMAIN: &[u8] = b"p2p-secure-session/profile/v1";

/// Signed profile fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInformation {
    /// Display name
    pub name: String,
    /// Free-form location
    pub location: String,
    /// Image reference or encoded image
    pub image: String,
    /// Ed25519 identity public key (hex)
    pub identity_public_key: String,
    /// X25519 chat public key (hex)
    pub chat_id_key: String,
    /// Signing time
    pub timestamp: DateTime<Utc>,
    /// Profile format version
    pub version: u16,
}

/// Signatures over the profile information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSignatures {
    /// Identity key signature (hex)
    pub identity_key: String,
}

/// A user profile with its signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Signed fields
    pub information: ProfileInformation,
    /// Signatures
    pub signatures: ProfileSignatures,
}

impl Profile {
    /// Create and sign a profile with the provider's identity and chat keys
    pub fn sign<K: KeyMaterialProvider + ?Sized>(
        name: &str,
        location: &str,
        image: &str,
        key_material: &K,
    ) -> Result<Self> {
        let information = ProfileInformation {
            name: name.to_string(),
            location: location.to_string(),
            image: image.to_string(),
            identity_public_key: hex::encode(key_material.identity_public_key()?),
            chat_id_key: hex::encode(key_material.chat_key_pair()?.public_key()),
            timestamp: Utc::now(),
            version: PROFILE_VERSION,
        };

        let hash = information_hash(&information)?;
        let signature = key_material.identity_sign(&hash)?;

        Ok(Self {
            information,
            signatures: ProfileSignatures {
                identity_key: hex::encode(signature),
            },
        })
    }

    /// The Ed25519 identity public key
    pub fn identity_public_key(&self) -> Result<[u8; 32]> {
        decode_key("identity_public_key", &self.information.identity_public_key)
    }

    /// The X25519 chat public key
    pub fn chat_public_key(&self) -> Result<[u8; 32]> {
        decode_key("chat_id_key", &self.information.chat_id_key)
    }

    /// Check the identity signature.
    ///
    /// Returns `Ok(false)` for a wrong signature and an error for malformed
    /// hex or key lengths.
    pub fn signatures_valid(&self) -> Result<bool> {
        let hash = information_hash(&self.information)?;
        let signature = hex::decode(&self.signatures.identity_key).map_err(|e| {
            ValidationError::InvalidHex {
                field: "signatures.identity_key".to_string(),
                reason: e.to_string(),
            }
        })?;

        let valid = verify_identity_signature(&self.identity_public_key()?, &hash, &signature)?;
        if !valid {
            warn!("profile signature for {} is invalid", self.information.name);
        }
        Ok(valid)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parse a profile from JSON without checking signatures
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

fn decode_key(field: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).map_err(|e| ValidationError::InvalidHex {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    let length = bytes.len();
    bytes.try_into().map_err(|_| {
        ValidationError::InvalidKeyLength {
            what: "profile public key",
            expected: 32,
            actual: length,
        }
        .into()
    })
}

fn information_hash(information: &ProfileInformation) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(PROFILE_DOMAIN);
    for field in [&information.name, &information.location, &information.image] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(information.timestamp.timestamp().to_be_bytes());
    hasher.update(information.timestamp.timestamp_subsec_nanos().to_be_bytes());
    hasher.update(decode_key("identity_public_key", &information.identity_public_key)?);
    hasher.update(decode_key("chat_id_key", &information.chat_id_key)?);
    hasher.update(information.version.to_be_bytes());
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyManager;
    use crate::utils::ErrorKind;

    #[test]
    fn test_signed_profile_verifies() {
        let manager = KeyManager::generate();
        let profile = Profile::sign("Alice", "Berlin", "", &manager).unwrap();

        assert!(profile.signatures_valid().unwrap());
        assert_eq!(
            profile.chat_public_key().unwrap(),
            manager.chat_key_pair().unwrap().public_key()
        );
    }

    #[test]
    fn test_altered_profile_fails() {
        let manager = KeyManager::generate();
        let mut profile = Profile::sign("Alice", "Berlin", "", &manager).unwrap();
        profile.information.location = "Paris".to_string();
        assert!(!profile.signatures_valid().unwrap());

        let mut profile = Profile::sign("Alice", "Berlin", "", &manager).unwrap();
        profile.information.chat_id_key = hex::encode(crate::crypto::ChatKeyPair::generate().public_key());
        assert!(!profile.signatures_valid().unwrap());
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let manager = KeyManager::generate();
        let mut profile = Profile::sign("ab", "c", "", &manager).unwrap();
        profile.information.name = "a".to_string();
        profile.information.location = "bc".to_string();
        assert!(!profile.signatures_valid().unwrap());
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let manager = KeyManager::generate();
        let profile = Profile::sign("Bob", "", "img", &manager).unwrap();

        let restored = Profile::from_json(&profile.to_json().unwrap()).unwrap();
        assert_eq!(profile, restored);
        assert!(restored.signatures_valid().unwrap());
    }

    #[test]
    fn test_malformed_keys_are_errors() {
        let manager = KeyManager::generate();
        let mut profile = Profile::sign("Bob", "", "", &manager).unwrap();
        profile.information.identity_public_key = "zz".to_string();

        let err = profile.signatures_valid().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_locked_key_manager() {
        let manager = KeyManager::generate();
        manager.lock();
        let err = Profile::sign("Bob", "", "", &manager).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
    }
}
