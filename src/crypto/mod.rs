//! Cryptography module - BLAKE3 hashing, Schnorr signatures, Merkle roots, key images

mod hash;
mod key_image;
mod merkle;
mod schnorr;

pub use hash::*;
pub use key_image::*;
pub use merkle::*;
pub use schnorr::*;
