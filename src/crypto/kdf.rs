//! HKDF-SHA256 helper shared by the handshake and the ratchet.

use crate::utils::{Result, ValidationError};
use hkdf::Hkdf;
use sha2::Sha256;

/// Largest output HKDF-SHA256 can produce
const HKDF_MAX_OUTPUT: usize = 255 * 32;

/// Derive `N` bytes with HKDF-SHA256
pub(crate) fn hkdf_sha256<const N: usize>(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
) -> Result<[u8; N]> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = [0u8; N];
    hkdf.expand(info, &mut output)
        .map_err(|_| ValidationError::InvalidKeyLength {
            what: "HKDF output",
            expected: HKDF_MAX_OUTPUT,
            actual: N,
        })?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_separates_outputs() {
        let a: [u8; 32] = hkdf_sha256(None, b"ikm", b"one").unwrap();
        let b: [u8; 32] = hkdf_sha256(None, b"ikm", b"two").unwrap();
        assert_ne!(a, b);
    }
}
