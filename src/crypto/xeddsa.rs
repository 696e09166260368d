//! XEdDSA signatures with X25519 keys.
//!
//! Lets the chat key sign its own signed prekey, so a prekey bundle can be
//! verified from the bundle's X25519 identity key alone. The construction
//! follows the XEdDSA description from the Signal specifications: the
//! Montgomery private key is mapped to an Edwards key pair whose public point
//! has a zero sign bit, and the verifier reconstructs that point from the
//! Montgomery u-coordinate.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

/// Length of an XEdDSA signature
pub const XEDDSA_SIGNATURE_LENGTH: usize = 64;

fn clamp(mut scalar: [u8; 32]) -> [u8; 32] {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    scalar
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Edwards key pair with a positive public point
fn calculate_key_pair(montgomery_secret: &[u8; 32]) -> (Scalar, CompressedEdwardsY) {
    let k = Scalar::from_bytes_mod_order(clamp(*montgomery_secret));
    let point = EdwardsPoint::mul_base(&k);
    let compressed = point.compress();

    if compressed.as_bytes()[31] & 0x80 == 0 {
        (k, compressed)
    } else {
        (-k, (-point).compress())
    }
}

/// Sign `message` with an X25519 private key
pub fn sign(montgomery_secret: &[u8; 32], message: &[u8]) -> [u8; XEDDSA_SIGNATURE_LENGTH] {
    let (a, public) = calculate_key_pair(montgomery_secret);

    let mut nonce = [0u8; 64];
    OsRng.fill_bytes(&mut nonce);

    // hash_1: the first 32 bytes are 2^256 - 2 in little endian
    let mut prefix = [0xFFu8; 32];
    prefix[0] = 0xFE;
    let r = hash_to_scalar(&[&prefix, a.as_bytes(), message, &nonce]);
    nonce.zeroize();

    let big_r = EdwardsPoint::mul_base(&r).compress();
    let h = hash_to_scalar(&[big_r.as_bytes(), public.as_bytes(), message]);
    let s = r + h * a;

    let mut signature = [0u8; XEDDSA_SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(big_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verify an XEdDSA signature against an X25519 public key
pub fn verify(montgomery_public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Some(public) = MontgomeryPoint(*montgomery_public).to_edwards(0) else {
        return false;
    };

    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);

    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };

    let h = hash_to_scalar(&[&r_bytes, public.compress().as_bytes(), message]);
    let check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &(-public), &s);

    check.compress().as_bytes() == &r_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::{PublicKey, StaticSecret};

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret.to_bytes(), public.to_bytes())
    }

    #[test]
    fn test_sign_and_verify() {
        for _ in 0..16 {
            let (secret, public) = keypair();
            let signature = sign(&secret, b"signed prekey");
            assert!(verify(&public, b"signed prekey", &signature));
        }
    }

    #[test]
    fn test_wrong_message_or_key_fails() {
        let (secret, public) = keypair();
        let (_, other_public) = keypair();
        let signature = sign(&secret, b"original");

        assert!(!verify(&public, b"altered", &signature));
        assert!(!verify(&other_public, b"original", &signature));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let (secret, public) = keypair();
        let signature = sign(&secret, b"payload");

        for byte in [0usize, 17, 31, 32, 48, 63] {
            let mut tampered = signature;
            tampered[byte] ^= 0x01;
            assert!(!verify(&public, b"payload", &tampered));
        }
    }
}
