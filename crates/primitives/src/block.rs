//! Block header and block types, merkle roots, and the witness commitment
//! layout.

use blkd_consensus::constants::{WITNESS_COMMITMENT_HEADER, WITNESS_SCALE_FACTOR};
use blkd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::script::OP_RETURN;
use crate::transaction::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Signature over the header hash by the coinstake key. Empty on
    /// proof-of-work blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            transactions: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// A block is proof-of-stake when its second transaction is a coinstake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coin_stake()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoder.write_bytes(&tx.consensus_encode());
        }
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    fn encode_without_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoder.write_bytes(&tx.consensus_encode_without_witness());
        }
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
            signature,
        })
    }

    pub fn weight(&self) -> u64 {
        let base = self.encode_without_witness().len() as u64;
        let total = self.consensus_encode().len() as u64;
        base * (WITNESS_SCALE_FACTOR - 1) + total
    }

    pub fn merkle_root(&self) -> Hash256 {
        let txids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.txid()).collect();
        compute_merkle_root(&txids)
    }

    /// Merkle root over wtxids with the coinbase entry zeroed, as committed
    /// to by the coinbase witness commitment.
    pub fn witness_merkle_root(&self) -> Hash256 {
        let mut hashes: Vec<Hash256> = Vec::with_capacity(self.transactions.len());
        for (i, tx) in self.transactions.iter().enumerate() {
            if i == 0 {
                hashes.push([0u8; 32]);
            } else {
                hashes.push(tx.wtxid());
            }
        }
        compute_merkle_root(&hashes)
    }

    pub fn max_transaction_time(&self) -> i64 {
        self.transactions
            .iter()
            .map(|tx| tx.time as i64)
            .max()
            .unwrap_or(0)
    }
}

pub fn compute_merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut layer: Vec<Hash256> = hashes.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(merkle_hash_pair(left, right));
        }
        layer = next;
    }
    layer[0]
}

fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    sha256d(&data)
}

/// Index of the witness commitment output in the coinbase, if any. The last
/// matching output wins.
pub fn witness_commitment_index(block: &Block) -> Option<usize> {
    let coinbase = block.transactions.first()?;
    let mut found = None;
    for (i, output) in coinbase.vout.iter().enumerate() {
        let script = &output.script_pubkey;
        if script.len() >= 38
            && script[0] == OP_RETURN
            && script[1] == 0x24
            && script[2..6] == WITNESS_COMMITMENT_HEADER
        {
            found = Some(i);
        }
    }
    found
}

/// The commitment payload: double-SHA-256 of the witness merkle root and the
/// reserved witness nonce (all zeros).
pub fn witness_commitment_payload(block: &Block) -> Hash256 {
    let witness_root = block.witness_merkle_root();
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&witness_root);
    // data[32..] stays zero: the reserved witness nonce.
    sha256d(&data)
}
