use rand::RngCore;

use crate::error::{KmeError, Result};

/// Produce `size_bits` worth of cryptographically strong key material.
///
/// `size_bits` must be a positive multiple of 8; this is the only
/// responsibility of this module, no other invariant is checked here.
pub fn generate(size_bits: u32) -> Result<Vec<u8>> {
    if size_bits == 0 || size_bits % 8 != 0 {
        return Err(KmeError::Validation(format!(
            "size_bits must be a positive multiple of 8, got {}",
            size_bits
        )));
    }

    let mut buf = vec![0u8; (size_bits / 8) as usize];
    rand::rngs::OsRng.fill_bytes(&mut buf);

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        let bytes = generate(256).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn rejects_non_byte_aligned_sizes() {
        assert!(generate(255).is_err());
    }

    #[test]
    fn rejects_zero() {
        assert!(generate(0).is_err());
    }

    #[test]
    fn two_calls_differ() {
        let a = generate(256).unwrap();
        let b = generate(256).unwrap();
        assert_ne!(a, b);
    }
}
