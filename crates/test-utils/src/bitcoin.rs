//! Module to generate arbitrary bitcoin values for testing.
use bitcoin::{
    absolute::LockTime,
    block,
    hashes::Hash,
    key::rand::{rngs::OsRng, Rng},
    script::Builder,
    secp256k1::{schnorr::Signature, Keypair, SecretKey, XOnlyPublicKey, SECP256K1},
    transaction::Version,
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use btcstaking_primitives::secp::EvenSecretKey;

/// Generates a random transaction ID.
pub fn generate_txid() -> Txid {
    let mut txid = [0u8; 32];
    OsRng.fill(&mut txid);

    Txid::from_slice(&txid).expect("should be able to generate arbitrary txid")
}

/// Generates a random outpoint.
pub fn generate_outpoint() -> OutPoint {
    let vout: u32 = OsRng.gen_range(0..8);

    OutPoint {
        txid: generate_txid(),
        vout,
    }
}

/// Generates a random signature.
pub fn generate_signature() -> Signature {
    let mut sig = [0u8; 64];
    OsRng.fill(&mut sig);

    Signature::from_slice(&sig).expect("should be able to generate arbitrary signature")
}

/// Generates a random secret key.
pub fn generate_secret_key() -> SecretKey {
    SecretKey::new(&mut OsRng)
}

/// Generates `count` distinct random secret keys.
pub fn generate_secret_keys(count: usize) -> Vec<SecretKey> {
    (0..count).map(|_| generate_secret_key()).collect()
}

/// Generates a random keypair that is guaranteed to be of even parity.
pub fn generate_keypair() -> Keypair {
    let sk: EvenSecretKey = generate_secret_key().into();

    Keypair::from_secret_key(SECP256K1, &sk)
}

/// Generates a random x-only public key.
pub fn generate_xonly_pubkey() -> XOnlyPublicKey {
    generate_keypair().x_only_public_key().0
}

/// Generates a random taproot key-path `script_pubkey`.
pub fn generate_p2tr_script() -> ScriptBuf {
    ScriptBuf::new_p2tr(SECP256K1, generate_xonly_pubkey(), None)
}

/// Generates a transaction with one random input and one output paying `value` to
/// `script_pubkey`.
pub fn generate_funding_tx(value: Amount, script_pubkey: ScriptBuf) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: generate_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey,
        }],
    }
}

/// Generates a random transaction with the given number of inputs and outputs.
pub fn generate_tx(num_inputs: usize, num_outputs: usize) -> Transaction {
    let input = (0..num_inputs)
        .map(|_| TxIn {
            previous_output: generate_outpoint(),
            witness: Witness::new(),
            sequence: Sequence::MAX,
            script_sig: ScriptBuf::new(),
        })
        .collect();

    let output = (0..num_outputs)
        .map(|_| TxOut {
            value: Amount::from_sat(OsRng.gen_range(1_000..1_000_000)),
            script_pubkey: generate_p2tr_script(),
        })
        .collect();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    }
}

/// Creates a test block at `height` that contains a coinbase followed by `txs`.
///
/// The coinbase carries the BIP34 height so that `block.bip34_block_height()` works.
pub fn generate_block_with_txs(height: u64, txs: Vec<Transaction>) -> Block {
    let coinbase_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(height as i64).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![],
    };

    let mut txdata = vec![coinbase_tx];
    txdata.extend(txs);

    Block {
        header: block::Header {
            version: block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: height as u32,
            bits: CompactTarget::from_consensus(0),
            nonce: 0,
        },
        txdata,
    }
}
