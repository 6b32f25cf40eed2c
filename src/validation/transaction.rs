//! Transaction structure and canonical encoding
//!
//! Version 1 inputs name the output they spend by (transaction hash, index).
//! Version 2 inputs name a ring of global output indexes that share one
//! amount, plus the key image of the member actually spent.

use serde::{Deserialize, Serialize};

use crate::crypto::{derive_key_image, hash_bytes, Hash, KeyImage, PublicKey, SchnorrSignature};
use crate::error::{CoreError, CoreResult};
use crate::serialization::{Reader, Writer};

pub const TX_VERSION_1: u8 = 1;
pub const TX_VERSION_2: u8 = 2;

const INPUT_TAG_TO_OUTPUT: u8 = 0x01;
const INPUT_TAG_TO_KEY: u8 = 0x02;

/// Smallest possible encodings, used to bound length prefixes while decoding
const MIN_INPUT_SIZE: usize = 1 + 32 + 4;
const MIN_OUTPUT_SIZE: usize = 8 + 32 + 1;
const SIGNATURE_SIZE: usize = 64;

/// A transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    /// Spend an output named by the transaction that created it
    ToOutput { tx_hash: Hash, output_index: u32 },
    /// Spend one member of a ring of same-amount outputs
    ToKey {
        amount: u64,
        /// Global output indexes, strictly ascending
        ring: Vec<u32>,
        key_image: KeyImage,
    },
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in atomic units
    pub amount: u64,
    /// One-time destination key
    pub key: PublicKey,
    /// Deposit lock in blocks, counted from the height the output is created at
    pub deposit_term: Option<u32>,
}

impl TxOutput {
    pub fn new(amount: u64, key: PublicKey) -> Self {
        Self {
            amount,
            key,
            deposit_term: None,
        }
    }

    pub fn deposit(amount: u64, key: PublicKey, term: u32) -> Self {
        Self {
            amount,
            key,
            deposit_term: Some(term),
        }
    }
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    /// Height (below `MAX_BLOCK_NUMBER`) or unix time before outputs can be spent
    pub unlock_time: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub extra: Vec<u8>,
    /// One signature per input over [`Transaction::prefix_hash`]
    pub signatures: Vec<SchnorrSignature>,
}

impl Transaction {
    /// Miner reward transaction. The height goes into `extra` so every
    /// coinbase has a distinct hash.
    pub fn coinbase(height: u64, unlock_time: u64, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION_1,
            unlock_time,
            inputs: Vec::new(),
            outputs,
            extra: height.to_le_bytes().to_vec(),
            signatures: Vec::new(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty() && self.signatures.is_empty()
    }

    /// Height recorded in a coinbase `extra`
    pub fn coinbase_height(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.extra.get(0..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    fn write_prefix(&self, w: &mut Writer) {
        w.u8(self.version).u64(self.unlock_time);

        w.len(self.inputs.len());
        for input in &self.inputs {
            match input {
                TxInput::ToOutput {
                    tx_hash,
                    output_index,
                } => {
                    w.u8(INPUT_TAG_TO_OUTPUT).hash(tx_hash).u32(*output_index);
                }
                TxInput::ToKey {
                    amount,
                    ring,
                    key_image,
                } => {
                    w.u8(INPUT_TAG_TO_KEY).u64(*amount).len(ring.len());
                    for index in ring {
                        w.u32(*index);
                    }
                    w.hash(key_image);
                }
            }
        }

        w.len(self.outputs.len());
        for output in &self.outputs {
            w.u64(output.amount).key(&output.key);
            match output.deposit_term {
                Some(term) => w.u8(1).u32(term),
                None => w.u8(0),
            };
        }

        w.blob(&self.extra);
    }

    /// Encoding without signatures
    pub fn prefix_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write_prefix(&mut w);
        w.into_bytes()
    }

    pub fn write(&self, w: &mut Writer) {
        self.write_prefix(w);
        w.len(self.signatures.len());
        for signature in &self.signatures {
            w.signature(signature);
        }
    }

    /// Full canonical encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_bytes()
    }

    pub fn read(r: &mut Reader<'_>) -> CoreResult<Self> {
        let version = r.u8()?;
        let unlock_time = r.u64()?;

        let input_count = r.len(MIN_INPUT_SIZE)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let input = match r.u8()? {
                INPUT_TAG_TO_OUTPUT => TxInput::ToOutput {
                    tx_hash: r.hash()?,
                    output_index: r.u32()?,
                },
                INPUT_TAG_TO_KEY => {
                    let amount = r.u64()?;
                    let ring_len = r.len(4)?;
                    let mut ring = Vec::with_capacity(ring_len);
                    for _ in 0..ring_len {
                        ring.push(r.u32()?);
                    }
                    TxInput::ToKey {
                        amount,
                        ring,
                        key_image: r.hash()?,
                    }
                }
                tag => {
                    return Err(CoreError::MalformedStructure(format!(
                        "unknown input tag {:#04x}",
                        tag
                    )))
                }
            };
            inputs.push(input);
        }

        let output_count = r.len(MIN_OUTPUT_SIZE)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let amount = r.u64()?;
            let key = r.key()?;
            let deposit_term = match r.u8()? {
                0 => None,
                1 => Some(r.u32()?),
                flag => {
                    return Err(CoreError::MalformedStructure(format!(
                        "unknown deposit flag {}",
                        flag
                    )))
                }
            };
            outputs.push(TxOutput {
                amount,
                key,
                deposit_term,
            });
        }

        let extra = r.blob()?;

        let signature_count = r.len(SIGNATURE_SIZE)?;
        let mut signatures = Vec::with_capacity(signature_count);
        for _ in 0..signature_count {
            signatures.push(r.signature()?);
        }

        Ok(Self {
            version,
            unlock_time,
            inputs,
            outputs,
            extra,
            signatures,
        })
    }

    /// Decode a standalone transaction, rejecting trailing bytes
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let mut r = Reader::new(bytes);
        let tx = Self::read(&mut r)?;
        r.finish()?;
        Ok(tx)
    }

    /// Message every input signature commits to
    pub fn prefix_hash(&self) -> Hash {
        hash_bytes(&self.prefix_bytes())
    }

    /// Transaction identity, covering the signatures
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }

    /// Encoded size in bytes
    pub fn size(&self) -> u64 {
        self.to_bytes().len() as u64
    }

    /// Sum of output amounts, `None` on overflow
    pub fn output_amount(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |sum, output| sum.checked_add(output.amount))
    }

    /// Principal locked by the deposit outputs of this transaction
    pub fn deposit_amount(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|output| output.deposit_term.is_some())
            .map(|output| output.amount)
            .sum()
    }

    pub fn creates_deposit(&self) -> bool {
        self.outputs.iter().any(|output| output.deposit_term.is_some())
    }

    /// Key images this transaction consumes, readable without chain state
    pub fn key_images(&self) -> Vec<KeyImage> {
        self.inputs
            .iter()
            .map(|input| match input {
                TxInput::ToOutput {
                    tx_hash,
                    output_index,
                } => derive_key_image(tx_hash, *output_index),
                TxInput::ToKey { key_image, .. } => *key_image,
            })
            .collect()
    }
}
