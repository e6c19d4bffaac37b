//! Transaction types and serialization.
//!
//! Transactions carry a timestamp after the version field; the timestamp is
//! part of the txid preimage and of every signature hash. Witness data uses
//! the extended marker/flag serialization and is excluded from the txid.

use blkd_consensus::constants::{LOCKTIME_THRESHOLD, SEQUENCE_FINAL, WITNESS_SCALE_FACTOR};
use blkd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::script;

pub const TX_VERSION: i32 = 2;

pub const SIGHASH_ALL: u32 = 1;

const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn from_outpoint(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// The sentinel for a pruned (spent) output.
    pub fn null() -> Self {
        Self {
            value: -1,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.value == -1 && self.script_pubkey.is_empty()
    }

    /// Empty the output in place: the coinstake marker form.
    pub fn set_empty(&mut self) {
        self.value = 0;
        self.script_pubkey.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(time: u32) -> Self {
        Self {
            version: TX_VERSION,
            time,
            vin: Vec::new(),
            vout: Vec::new(),
            lock_time: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn is_coin_stake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    pub fn value_out(&self) -> i64 {
        self.vout.iter().map(|out| out.value).sum()
    }

    fn encode_body(&self, encoder: &mut Encoder, include_witness: bool) {
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        let serialize_witness = include_witness && self.has_witness();
        if serialize_witness {
            encoder.write_u8(WITNESS_MARKER);
            encoder.write_u8(WITNESS_FLAG);
        }
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        if serialize_witness {
            for input in &self.vin {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_body(&mut encoder, true);
        encoder.into_inner()
    }

    pub fn consensus_encode_without_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_body(&mut encoder, false);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let time = decoder.read_u32_le()?;

        let mut vin_count = decoder.read_varint()?;
        let mut has_witness = false;
        if vin_count == WITNESS_MARKER as u64 {
            // Extended format: zero inputs means marker + flag.
            let flag = decoder.read_u8()?;
            if flag != WITNESS_FLAG {
                return Err(DecodeError::InvalidData("unknown transaction flag"));
            }
            has_witness = true;
            vin_count = decoder.read_varint()?;
        }

        let vin_count = usize::try_from(vin_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vin = Vec::with_capacity(vin_count);
        for _ in 0..vin_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }

        let vout_count = decoder.read_varint()?;
        let vout_count = usize::try_from(vout_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vout = Vec::with_capacity(vout_count);
        for _ in 0..vout_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }

        if has_witness {
            let mut any = false;
            for input in vin.iter_mut() {
                let items = decoder.read_varint()?;
                let items = usize::try_from(items).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut witness = Vec::with_capacity(items);
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                any |= !witness.is_empty();
                input.witness = witness;
            }
            if !any {
                return Err(DecodeError::InvalidData("witness flag without witness"));
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    /// Transaction id: double-SHA-256 of the serialization without witness.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode_without_witness())
    }

    /// Witness transaction id. Equals the txid for transactions that carry
    /// no witness data.
    pub fn wtxid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn base_size(&self) -> u64 {
        self.consensus_encode_without_witness().len() as u64
    }

    pub fn total_size(&self) -> u64 {
        self.consensus_encode().len() as u64
    }

    /// Block weight contribution: base size counts at the witness scale
    /// factor, witness bytes count once.
    pub fn weight(&self) -> u64 {
        self.base_size() * (WITNESS_SCALE_FACTOR - 1) + self.total_size()
    }

    pub fn vsize(&self) -> u64 {
        (self.weight() + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR
    }

    /// Legacy sigop count over all input and output scripts, unweighted.
    pub fn legacy_sig_op_count(&self) -> u32 {
        let mut count = 0;
        for input in &self.vin {
            count += script::legacy_sig_op_count(&input.script_sig, false);
        }
        for output in &self.vout {
            count += script::legacy_sig_op_count(&output.script_pubkey, false);
        }
        count
    }

    /// Finality for inclusion in a block at `height` whose locktime cutoff
    /// is `block_time`.
    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.vin
            .iter()
            .all(|input| input.sequence == SEQUENCE_FINAL)
    }

    /// Legacy signature hash: the input's scriptSig is replaced by
    /// `script_code`, every other scriptSig is emptied, and the hash type is
    /// appended to the preimage.
    pub fn signature_hash(&self, input_index: usize, script_code: &[u8], hash_type: u32) -> Option<Hash256> {
        if input_index >= self.vin.len() {
            return None;
        }
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        encoder.write_varint(self.vin.len() as u64);
        for (i, input) in self.vin.iter().enumerate() {
            input.prevout.consensus_encode(&mut encoder);
            if i == input_index {
                encoder.write_var_bytes(script_code);
            } else {
                encoder.write_var_bytes(&[]);
            }
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.write_u32_le(hash_type);
        Some(sha256d(&encoder.into_inner()))
    }
}
