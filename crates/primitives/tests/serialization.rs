use blkd_consensus::Hash256;
use blkd_primitives::block::{Block, BlockHeader};
use blkd_primitives::outpoint::OutPoint;
use blkd_primitives::transaction::{Transaction, TxIn, TxOut};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u8(&mut self) -> u8 {
        self.next_u64() as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_bytes(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_tx(rng: &mut Lcg, with_witness: bool) -> Transaction {
    let mut tx = Transaction::new(rng.next_u32());
    let vin_count = 1 + rng.gen_range(4);
    for _ in 0..vin_count {
        let mut input = TxIn::from_outpoint(OutPoint {
            hash: random_hash(rng),
            index: rng.next_u32() % 16,
        });
        input.script_sig = random_bytes(rng, 64);
        input.sequence = rng.next_u32();
        if with_witness && rng.gen_range(2) == 1 {
            let items = 1 + rng.gen_range(3);
            input.witness = (0..items).map(|_| random_bytes(rng, 72)).collect();
        }
        tx.vin.push(input);
    }
    let vout_count = 1 + rng.gen_range(4);
    for _ in 0..vout_count {
        tx.vout.push(TxOut {
            value: (rng.next_u64() % 1_000_000_000) as i64,
            script_pubkey: random_bytes(rng, 40),
        });
    }
    tx.lock_time = rng.next_u32();
    tx
}

#[test]
fn transaction_roundtrip() {
    let mut rng = Lcg::new(0x5eed_0001);
    for case in 0..64 {
        let tx = random_tx(&mut rng, case % 2 == 0);
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx, "case {case}");
        assert_eq!(decoded.consensus_encode(), bytes, "case {case}");
        assert_eq!(decoded.txid(), tx.txid());
        assert_eq!(decoded.wtxid(), tx.wtxid());
    }
}

#[test]
fn txid_is_witness_independent() {
    let mut rng = Lcg::new(0x5eed_0002);
    for _ in 0..16 {
        let mut tx = random_tx(&mut rng, false);
        let txid = tx.txid();
        tx.vin[0].witness = vec![random_bytes(&mut rng, 72)];
        assert_eq!(tx.txid(), txid);
    }
}

#[test]
fn block_roundtrip() {
    let mut rng = Lcg::new(0x5eed_0003);
    for case in 0..32 {
        let mut block = Block::new(BlockHeader {
            version: 2,
            prev_block: random_hash(&mut rng),
            merkle_root: random_hash(&mut rng),
            time: rng.next_u32(),
            bits: rng.next_u32(),
            nonce: rng.next_u32(),
        });
        let tx_count = 1 + rng.gen_range(5);
        for i in 0..tx_count {
            block.transactions.push(random_tx(&mut rng, i % 2 == 1));
        }
        if case % 2 == 0 {
            block.signature = random_bytes(&mut rng, 72);
        }
        block.header.merkle_root = block.merkle_root();

        let bytes = block.consensus_encode();
        let decoded = Block::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, block, "case {case}");
        // Re-serializing the re-parsed block is byte identical.
        assert_eq!(decoded.consensus_encode(), bytes, "case {case}");
        assert_eq!(decoded.merkle_root(), block.header.merkle_root);
    }
}
