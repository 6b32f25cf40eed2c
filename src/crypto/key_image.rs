//! Key images
//!
//! A key image is derived from the output it consumes, so the same output
//! always yields the same image no matter which chain it ends up on.

use super::{hash_parts, Hash, KeyImage};

const KEY_IMAGE_DOMAIN: &[u8] = b"lithe/key_image";

/// Key image of output `output_index` of transaction `tx_hash`
pub fn derive_key_image(tx_hash: &Hash, output_index: u32) -> KeyImage {
    hash_parts(&[KEY_IMAGE_DOMAIN, &tx_hash.0, &output_index.to_le_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    #[test]
    fn test_key_image_is_per_output() {
        let tx = hash_bytes(b"tx");
        assert_eq!(derive_key_image(&tx, 0), derive_key_image(&tx, 0));
        assert_ne!(derive_key_image(&tx, 0), derive_key_image(&tx, 1));
        assert_ne!(derive_key_image(&tx, 0), derive_key_image(&hash_bytes(b"tx2"), 0));
    }
}
