//! Staking scripts and the slashing spend path.
//!
//! Every staking output is a taproot output with an unspendable internal key and three leaves:
//!
//! ```text
//! time lock:  <Staker_PK> OP_CHECKSIGVERIFY <Staking_Time> OP_CHECKSEQUENCEVERIFY
//! unbonding:  <Staker_PK> OP_CHECKSIGVERIFY <covenant multisig>
//! slashing:   <Staker_PK> OP_CHECKSIGVERIFY <FP 1-of-n multisig, verify> <covenant multisig>
//! ```
//!
//! The unbonding output carries only the time lock (with the unbonding time) and slashing leaves.

use std::collections::BTreeMap;

use bitcoin::{
    hashes::Hash,
    opcodes::all::{
        OP_CHECKSIG, OP_CHECKSIGADD, OP_CHECKSIGVERIFY, OP_CSV, OP_NUMEQUAL, OP_NUMEQUALVERIFY,
    },
    script::Builder,
    sighash::{Prevouts, SighashCache},
    taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo},
    ScriptBuf, TapLeafHash, TapSighashType, Transaction, TxOut, Witness,
};
use secp256k1::{schnorr, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};

use crate::{constants::UNSPENDABLE_INTERNAL_KEY, errors::ScriptError, types::SlashingTxKind};

/// Sorts public keys in lexicographical order of their serialization.
pub fn sort_keys(keys: &mut [XOnlyPublicKey]) {
    keys.sort_by_key(|key| key.serialize());
}

fn prepare_keys_for_multisig_script(
    keys: &[XOnlyPublicKey],
) -> Result<Vec<XOnlyPublicKey>, ScriptError> {
    if keys.is_empty() {
        return Err(ScriptError::NoKeys);
    }

    let mut sorted = keys.to_vec();
    sort_keys(&mut sorted);

    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(ScriptError::DuplicateKeys);
    }

    Ok(sorted)
}

/// Builds a `quorum`-of-n multisig script over the sorted keys.
///
/// A single key degenerates to a plain signature check.
pub fn build_multisig_script(
    keys: &[XOnlyPublicKey],
    quorum: usize,
    with_verify: bool,
) -> Result<ScriptBuf, ScriptError> {
    let keys = prepare_keys_for_multisig_script(keys)?;
    if quorum == 0 || quorum > keys.len() {
        return Err(ScriptError::InvalidQuorum {
            quorum,
            keys: keys.len(),
        });
    }

    if keys.len() == 1 {
        return Ok(build_single_key_sig_script(&keys[0], with_verify));
    }

    let mut builder = Builder::new();
    for (i, key) in keys.iter().enumerate() {
        builder = builder.push_slice(key.serialize());
        builder = match i {
            0 => builder.push_opcode(OP_CHECKSIG),
            _ => builder.push_opcode(OP_CHECKSIGADD),
        };
    }

    builder = builder.push_int(quorum as i64);
    builder = match with_verify {
        true => builder.push_opcode(OP_NUMEQUALVERIFY),
        false => builder.push_opcode(OP_NUMEQUAL),
    };

    Ok(builder.into_script())
}

/// Builds `<pk> OP_CHECKSIG[VERIFY]`.
pub fn build_single_key_sig_script(pk: &XOnlyPublicKey, with_verify: bool) -> ScriptBuf {
    let builder = Builder::new().push_slice(pk.serialize());
    match with_verify {
        true => builder.push_opcode(OP_CHECKSIGVERIFY),
        false => builder.push_opcode(OP_CHECKSIG),
    }
    .into_script()
}

/// Builds `<pk> OP_CHECKSIGVERIFY <lock_time> OP_CHECKSEQUENCEVERIFY`.
pub fn build_time_lock_script(pk: &XOnlyPublicKey, lock_time: u16) -> ScriptBuf {
    Builder::new()
        .push_slice(pk.serialize())
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(lock_time as i64)
        .push_opcode(OP_CSV)
        .into_script()
}

fn aggregate_scripts(scripts: &[&ScriptBuf]) -> ScriptBuf {
    ScriptBuf::from_bytes(
        scripts
            .iter()
            .flat_map(|s| s.as_bytes().iter().copied())
            .collect(),
    )
}

/// All leaf scripts of a staking (or unbonding) output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingScriptPaths {
    /// The path for withdrawing after the time lock expires.
    pub time_lock_path_script: ScriptBuf,

    /// The path for on-demand unbonding, co-signed by the covenant committee.
    pub unbonding_path_script: ScriptBuf,

    /// The path for slashing, co-signed by one finality provider and the covenant committee.
    pub slashing_path_script: ScriptBuf,
}

impl StakingScriptPaths {
    /// Builds the scripts for the given participants.
    pub fn new(
        staker_key: &XOnlyPublicKey,
        fp_keys: &[XOnlyPublicKey],
        covenant_keys: &[XOnlyPublicKey],
        covenant_quorum: usize,
        lock_time: u16,
    ) -> Result<Self, ScriptError> {
        let time_lock_path_script = build_time_lock_script(staker_key, lock_time);
        let covenant_multisig_script =
            build_multisig_script(covenant_keys, covenant_quorum, false)?;
        let staker_sig_script = build_single_key_sig_script(staker_key, true);
        let fp_script = build_multisig_script(fp_keys, 1, true)?;

        let unbonding_path_script =
            aggregate_scripts(&[&staker_sig_script, &covenant_multisig_script]);
        let slashing_path_script =
            aggregate_scripts(&[&staker_sig_script, &fp_script, &covenant_multisig_script]);

        Ok(Self {
            time_lock_path_script,
            unbonding_path_script,
            slashing_path_script,
        })
    }
}

/// The script structure of a delegation's slashing path.
///
/// Immutable once built from the delegation and the staking parameters it was created under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingPath {
    /// The delegator's key.
    pub staker_pk: XOnlyPublicKey,

    /// The finality providers the delegation is restaked to, in delegation order.
    pub fp_pks: Vec<XOnlyPublicKey>,

    /// The covenant committee.
    pub covenant_pks: Vec<XOnlyPublicKey>,

    /// The number of covenant signatures needed on the slashing path.
    pub covenant_quorum: u32,

    /// Relative time lock of the staking output.
    pub staking_time: u16,

    /// Relative time lock of the unbonding output.
    pub unbonding_time: u16,
}

impl SlashingPath {
    /// Covenant keys in script order.
    pub fn sorted_covenant_pks(&self) -> Vec<XOnlyPublicKey> {
        let mut keys = self.covenant_pks.clone();
        sort_keys(&mut keys);
        keys
    }

    /// Finality provider keys in script order.
    pub fn sorted_fp_pks(&self) -> Vec<XOnlyPublicKey> {
        let mut keys = self.fp_pks.clone();
        sort_keys(&mut keys);
        keys
    }

    fn scripts(&self, kind: SlashingTxKind) -> Result<StakingScriptPaths, ScriptError> {
        let lock_time = match kind {
            SlashingTxKind::StakingSlashing => self.staking_time,
            SlashingTxKind::UnbondingSlashing => self.unbonding_time,
        };

        StakingScriptPaths::new(
            &self.staker_pk,
            &self.fp_pks,
            &self.covenant_pks,
            self.covenant_quorum as usize,
            lock_time,
        )
    }

    /// The slashing leaf script. It is identical on the staking and the unbonding output.
    pub fn slashing_script(&self) -> Result<ScriptBuf, ScriptError> {
        Ok(self.scripts(SlashingTxKind::StakingSlashing)?.slashing_path_script)
    }

    /// The taproot tree of the output spent by a slashing tx of the given kind.
    pub fn spend_info(&self, kind: SlashingTxKind) -> Result<TaprootSpendInfo, ScriptError> {
        let scripts = self.scripts(kind)?;

        let builder = match kind {
            SlashingTxKind::StakingSlashing => TaprootBuilder::new()
                .add_leaf(1, scripts.slashing_path_script)
                .and_then(|b| b.add_leaf(2, scripts.time_lock_path_script))
                .and_then(|b| b.add_leaf(2, scripts.unbonding_path_script)),
            SlashingTxKind::UnbondingSlashing => TaprootBuilder::new()
                .add_leaf(1, scripts.slashing_path_script)
                .and_then(|b| b.add_leaf(1, scripts.time_lock_path_script)),
        }
        .map_err(|e| ScriptError::Taproot(e.to_string()))?;

        builder
            .finalize(SECP256K1, *UNSPENDABLE_INTERNAL_KEY)
            .map_err(|_| ScriptError::Taproot("incomplete tree".to_string()))
    }

    /// The `script_pubkey` of the output spent by a slashing tx of the given kind.
    pub fn output_script(&self, kind: SlashingTxKind) -> Result<ScriptBuf, ScriptError> {
        let info = self.spend_info(kind)?;
        Ok(ScriptBuf::new_p2tr(
            SECP256K1,
            info.internal_key(),
            info.merkle_root(),
        ))
    }

    /// The control block proving the slashing leaf in the output spent by `kind`.
    pub fn slashing_control_block(
        &self,
        kind: SlashingTxKind,
    ) -> Result<ControlBlock, ScriptError> {
        let script = self.slashing_script()?;
        self.spend_info(kind)?
            .control_block(&(script, LeafVersion::TapScript))
            .ok_or_else(|| ScriptError::Taproot("slashing leaf missing from tree".to_string()))
    }

    /// The BIP341 sighash every slashing-path signer commits to.
    pub fn slashing_sighash(
        &self,
        slashing_tx: &Transaction,
        prevout: &TxOut,
    ) -> Result<[u8; 32], ScriptError> {
        if slashing_tx.input.len() != 1 {
            return Err(ScriptError::InputCount(slashing_tx.input.len()));
        }

        let leaf_hash = TapLeafHash::from_script(&self.slashing_script()?, LeafVersion::TapScript);
        let sighash = SighashCache::new(slashing_tx)
            .taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&[prevout]),
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(|e| ScriptError::Sighash(e.to_string()))?;

        Ok(sighash.to_byte_array())
    }

    /// Assembles the witness spending the slashing leaf.
    ///
    /// Covenant signatures are laid out in reverse script order with an empty element for every
    /// covenant member that did not sign, followed by the finality provider slots (again in
    /// reverse order, only `fp_pk` filled), the delegator signature, the script and the control
    /// block.
    pub fn slashing_witness(
        &self,
        kind: SlashingTxKind,
        covenant_sigs: &BTreeMap<XOnlyPublicKey, schnorr::Signature>,
        fp_pk: &XOnlyPublicKey,
        fp_sig: &schnorr::Signature,
        delegator_sig: &schnorr::Signature,
    ) -> Result<Witness, ScriptError> {
        let mut witness = Witness::new();

        for cov_pk in self.sorted_covenant_pks().iter().rev() {
            match covenant_sigs.get(cov_pk) {
                Some(sig) => witness.push(sig.serialize()),
                None => witness.push(Vec::<u8>::new()),
            }
        }

        for pk in self.sorted_fp_pks().iter().rev() {
            match pk == fp_pk {
                true => witness.push(fp_sig.serialize()),
                false => witness.push(Vec::<u8>::new()),
            }
        }

        witness.push(delegator_sig.serialize());
        witness.push(self.slashing_script()?.as_bytes());
        witness.push(self.slashing_control_block(kind)?.serialize());

        Ok(witness)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::opcodes::all::OP_PUSHBYTES_32;
    use secp256k1::{rand::rngs::OsRng, SecretKey};

    use super::*;

    fn keys(n: usize) -> Vec<XOnlyPublicKey> {
        (0..n)
            .map(|_| SecretKey::new(&mut OsRng).x_only_public_key(SECP256K1).0)
            .collect()
    }

    fn path(num_fps: usize) -> SlashingPath {
        SlashingPath {
            staker_pk: keys(1)[0],
            fp_pks: keys(num_fps),
            covenant_pks: keys(3),
            covenant_quorum: 2,
            staking_time: 1_000,
            unbonding_time: 101,
        }
    }

    #[test]
    fn sort_keys_is_lexicographic() {
        let mut ks = keys(8);
        sort_keys(&mut ks);
        assert!(ks.windows(2).all(|w| w[0].serialize() <= w[1].serialize()));
    }

    #[test]
    fn multisig_rejects_bad_inputs() {
        let ks = keys(3);
        assert_eq!(build_multisig_script(&[], 1, false), Err(ScriptError::NoKeys));
        assert_eq!(
            build_multisig_script(&[ks[0], ks[0]], 1, false),
            Err(ScriptError::DuplicateKeys)
        );
        assert_eq!(
            build_multisig_script(&ks, 4, false),
            Err(ScriptError::InvalidQuorum { quorum: 4, keys: 3 })
        );
    }

    #[test]
    fn single_fp_uses_checksigverify() {
        let p = path(1);
        let script = p.slashing_script().unwrap();
        let bytes = script.as_bytes();

        // <staker> CHECKSIGVERIFY <fp> CHECKSIGVERIFY ...
        assert_eq!(bytes[0], OP_PUSHBYTES_32.to_u8());
        assert_eq!(bytes[33], OP_CHECKSIGVERIFY.to_u8());
        assert_eq!(bytes[34], OP_PUSHBYTES_32.to_u8());
        assert_eq!(bytes[67], OP_CHECKSIGVERIFY.to_u8());
        assert_eq!(bytes.last().copied(), Some(OP_NUMEQUAL.to_u8()));
    }

    #[test]
    fn control_blocks_verify_against_outputs() {
        let p = path(2);
        let script = p.slashing_script().unwrap();

        for kind in [SlashingTxKind::StakingSlashing, SlashingTxKind::UnbondingSlashing] {
            let output_key = p.spend_info(kind).unwrap().output_key().to_inner();
            let cb = p.slashing_control_block(kind).unwrap();
            assert!(cb.verify_taproot_commitment(SECP256K1, output_key, &script));
        }
    }

    #[test]
    fn staking_and_unbonding_outputs_differ() {
        let p = path(1);
        assert_ne!(
            p.output_script(SlashingTxKind::StakingSlashing).unwrap(),
            p.output_script(SlashingTxKind::UnbondingSlashing).unwrap()
        );
    }
}
