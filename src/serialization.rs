//! Canonical binary encoding
//!
//! Fixed-width little-endian integers and `u32` length prefixes. This is
//! the format blocks and transactions are hashed in and the format raw
//! submissions arrive in. Decoding is strict: truncation, trailing bytes
//! and unknown tags are all rejected.

use crate::crypto::{Hash, PublicKey, SchnorrSignature};
use crate::error::{CoreError, CoreResult};

/// Append-only byte sink
#[derive(Debug, Default)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn hash(&mut self, value: &Hash) -> &mut Self {
        self.bytes.extend_from_slice(&value.0);
        self
    }

    pub fn key(&mut self, value: &PublicKey) -> &mut Self {
        self.bytes.extend_from_slice(&value.0);
        self
    }

    pub fn signature(&mut self, value: &SchnorrSignature) -> &mut Self {
        self.bytes.extend_from_slice(&value.0);
        self
    }

    /// Collection length prefix
    pub fn len(&mut self, len: usize) -> &mut Self {
        self.u32(len as u32)
    }

    /// Length-prefixed byte blob
    pub fn blob(&mut self, value: &[u8]) -> &mut Self {
        self.len(value.len());
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn raw(&mut self, value: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Cursor over an encoded buffer
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                CoreError::MalformedStructure(format!("truncated input at byte {}", self.pos))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn hash(&mut self) -> CoreResult<Hash> {
        Ok(Hash(self.array()?))
    }

    pub fn key(&mut self) -> CoreResult<PublicKey> {
        Ok(PublicKey(self.array()?))
    }

    pub fn signature(&mut self) -> CoreResult<SchnorrSignature> {
        Ok(SchnorrSignature(self.array()?))
    }

    /// Collection length, bounded by the bytes left so a forged prefix
    /// cannot trigger a huge allocation. `min_item_size` is the smallest
    /// encoding of one element.
    pub fn len(&mut self, min_item_size: usize) -> CoreResult<usize> {
        let len = self.u32()? as usize;
        if len.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(CoreError::MalformedStructure(format!(
                "length prefix {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        Ok(len)
    }

    pub fn blob(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.len(1)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails unless every byte was consumed
    pub fn finish(self) -> CoreResult<()> {
        if self.remaining() != 0 {
            return Err(CoreError::MalformedStructure(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_integers_are_little_endian() {
        let mut w = Writer::new();
        w.u32(1).u64(2);
        assert_eq!(w.into_bytes(), vec![1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u32().unwrap_err().kind(), ErrorKind::MalformedStructure);
    }

    #[test]
    fn test_forged_length_prefix_rejected() {
        let mut w = Writer::new();
        w.u32(1_000_000).raw(&[0u8; 8]);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(r.len(1).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut r = Reader::new(&[7, 9]);
        assert_eq!(r.u8().unwrap(), 7);
        assert!(r.finish().is_err());
    }
}
