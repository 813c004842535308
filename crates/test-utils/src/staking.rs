//! Synthetic, fully signed delegations.
//!
//! The fixtures here build real staking, unbonding and slashing transactions with real covenant
//! adaptor signatures, so the slashing transactions can be completed (and their witnesses parsed
//! back) exactly like the ones seen on Bitcoin.

use std::collections::BTreeMap;

use bitcoin::{
    secp256k1::{schnorr, Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1},
    Amount, OutPoint, Transaction, TxOut,
};
use btcstaking_primitives::{
    adaptor::AdaptorSignature,
    eots,
    scripts::SlashingPath,
    types::{
        BtcDelegation, BtcDelegationStatus, BtcUndelegation, CovenantAdaptorSignatures, Evidence,
        SlashingTxKind, StakingParams,
    },
};

use crate::bitcoin::{
    generate_funding_tx, generate_p2tr_script, generate_secret_key, generate_secret_keys,
    generate_signature,
};

/// Default stake of a fixture delegation.
pub const DEFAULT_STAKE: Amount = Amount::from_sat(1_000_000);

/// Fee deducted by every fixture transaction spending a staking or unbonding output.
pub const FIXTURE_FEE: Amount = Amount::from_sat(1_000);

/// A covenant committee with known secret keys.
#[derive(Debug, Clone)]
pub struct CovenantCommittee {
    /// The members' secret keys, in committee order.
    pub sks: Vec<SecretKey>,

    /// The staking parameters naming this committee.
    pub params: StakingParams,
}

impl CovenantCommittee {
    /// Creates a committee of `size` members with the given quorum.
    pub fn new(size: usize, quorum: u32) -> Self {
        let sks = generate_secret_keys(size);
        let covenant_pks = sks
            .iter()
            .map(|sk| sk.x_only_public_key(SECP256K1).0)
            .collect();

        Self {
            sks,
            params: StakingParams {
                version: 0,
                covenant_pks,
                covenant_quorum: quorum,
            },
        }
    }

    fn adaptor_sigs(
        &self,
        fp_pks: &[XOnlyPublicKey],
        sighash: &[u8; 32],
    ) -> Vec<CovenantAdaptorSignatures> {
        self.sks
            .iter()
            .map(|sk| CovenantAdaptorSignatures {
                cov_pk: sk.x_only_public_key(SECP256K1).0,
                adaptor_sigs: fp_pks
                    .iter()
                    .map(|fp_pk| {
                        AdaptorSignature::enc_sign(sk, fp_pk, sighash)
                            .expect("must be able to adaptor sign")
                            .to_bytes()
                            .to_vec()
                    })
                    .collect(),
            })
            .collect()
    }
}

/// A delegation together with every secret involved in creating it.
#[derive(Debug, Clone)]
pub struct DelegationFixture {
    /// The delegator's secret key.
    pub staker_sk: SecretKey,

    /// The finality providers' secret keys, in delegation order.
    pub fp_sks: Vec<SecretKey>,

    /// The committee that co-signed the delegation.
    pub committee: CovenantCommittee,

    /// The chain-side record.
    pub delegation: BtcDelegation,
}

fn sign(sk: &SecretKey, sighash: &[u8; 32]) -> schnorr::Signature {
    let keypair = Keypair::from_secret_key(SECP256K1, sk);
    SECP256K1.sign_schnorr(&Message::from_digest(*sighash), &keypair)
}

fn spending_tx(prevout: OutPoint, value: Amount, script_pubkey: bitcoin::ScriptBuf) -> Transaction {
    let mut tx = generate_funding_tx(value, script_pubkey);
    tx.input[0].previous_output = prevout;
    tx
}

impl DelegationFixture {
    /// Creates an active delegation to the given finality providers.
    ///
    /// With `unbonded`, the delegation also carries an on-demand unbonding with its own
    /// pre-signed slashing transaction and is reported as unbonded.
    pub fn new(committee: &CovenantCommittee, fp_sks: Vec<SecretKey>, unbonded: bool) -> Self {
        let staker_sk = generate_secret_key();
        let fp_btc_pk_list: Vec<_> = fp_sks
            .iter()
            .map(|sk| sk.x_only_public_key(SECP256K1).0)
            .collect();

        let path = SlashingPath {
            staker_pk: staker_sk.x_only_public_key(SECP256K1).0,
            fp_pks: fp_btc_pk_list.clone(),
            covenant_pks: committee.params.covenant_pks.clone(),
            covenant_quorum: committee.params.covenant_quorum,
            staking_time: 1_000,
            unbonding_time: 101,
        };

        let staking_tx = generate_funding_tx(
            DEFAULT_STAKE,
            path.output_script(SlashingTxKind::StakingSlashing)
                .expect("must be able to build staking output"),
        );
        let staking_outpoint = OutPoint::new(staking_tx.compute_txid(), 0);
        let staking_output = staking_tx.output[0].clone();

        let slashing_tx = spending_tx(
            staking_outpoint,
            DEFAULT_STAKE - FIXTURE_FEE,
            generate_p2tr_script(),
        );
        let sighash = path
            .slashing_sighash(&slashing_tx, &staking_output)
            .expect("must be able to compute sighash");

        let undelegation = unbonded.then(|| {
            let unbonding_value = DEFAULT_STAKE - FIXTURE_FEE;
            let unbonding_tx = spending_tx(
                staking_outpoint,
                unbonding_value,
                path.output_script(SlashingTxKind::UnbondingSlashing)
                    .expect("must be able to build unbonding output"),
            );
            let unbonding_output = unbonding_tx.output[0].clone();
            let slashing_tx = spending_tx(
                OutPoint::new(unbonding_tx.compute_txid(), 0),
                unbonding_value - FIXTURE_FEE,
                generate_p2tr_script(),
            );
            let sighash = path
                .slashing_sighash(&slashing_tx, &unbonding_output)
                .expect("must be able to compute sighash");

            BtcUndelegation {
                delegator_slashing_sig: sign(&staker_sk, &sighash),
                covenant_slashing_sigs: committee.adaptor_sigs(&fp_btc_pk_list, &sighash),
                delegator_unbonding_sig: Some(generate_signature()),
                unbonding_tx,
                slashing_tx,
            }
        });

        let delegation = BtcDelegation {
            staker_pk: path.staker_pk,
            fp_btc_pk_list: fp_btc_pk_list.clone(),
            staking_time: path.staking_time,
            unbonding_time: path.unbonding_time,
            total_sat: DEFAULT_STAKE,
            staking_output_idx: 0,
            delegator_slashing_sig: sign(&staker_sk, &sighash),
            covenant_sigs: committee.adaptor_sigs(&fp_btc_pk_list, &sighash),
            status: match unbonded {
                true => BtcDelegationStatus::Unbonded,
                false => BtcDelegationStatus::Active,
            },
            undelegation,
            params_version: committee.params.version,
            staking_tx,
            slashing_tx,
        };

        Self {
            staker_sk,
            fp_sks,
            committee: committee.clone(),
            delegation,
        }
    }

    /// The slashing path of the delegation.
    pub fn slashing_path(&self) -> SlashingPath {
        self.delegation.slashing_path(&self.committee.params)
    }

    /// Completes the slashing transaction of `kind` the way a colluding finality provider would:
    /// it decrypts a quorum of covenant adaptor signatures with its own key and signs.
    pub fn selectively_slashed_tx(&self, fp_idx: usize, kind: SlashingTxKind) -> Transaction {
        let (mut tx, prevout, delegator_sig, cov_sigs) = match kind {
            SlashingTxKind::StakingSlashing => (
                self.delegation.slashing_tx.clone(),
                self.delegation.staking_tx.output[0].clone(),
                self.delegation.delegator_slashing_sig,
                &self.delegation.covenant_sigs,
            ),
            SlashingTxKind::UnbondingSlashing => {
                let undelegation = self
                    .delegation
                    .undelegation
                    .as_ref()
                    .expect("fixture must be unbonded");
                (
                    undelegation.slashing_tx.clone(),
                    undelegation.unbonding_tx.output[0].clone(),
                    undelegation.delegator_slashing_sig,
                    &undelegation.covenant_slashing_sigs,
                )
            }
        };

        let fp_sk = &self.fp_sks[fp_idx];
        let fp_pk = fp_sk.x_only_public_key(SECP256K1).0;
        let path = self.slashing_path();
        let sighash = path
            .slashing_sighash(&tx, &prevout)
            .expect("must be able to compute sighash");

        let covenant_sigs: BTreeMap<XOnlyPublicKey, schnorr::Signature> = cov_sigs
            .iter()
            .take(self.committee.params.covenant_quorum as usize)
            .map(|cov| {
                let asig = cov
                    .adaptor_sig(fp_idx)
                    .expect("must have an adaptor sig per fp")
                    .expect("must be a valid adaptor sig");
                let sig = asig.decrypt(fp_sk).expect("must be able to decrypt");
                (cov.cov_pk, sig)
            })
            .collect();

        tx.input[0].witness = path
            .slashing_witness(
                kind,
                &covenant_sigs,
                &fp_pk,
                &sign(fp_sk, &sighash),
                &delegator_sig,
            )
            .expect("must be able to build witness");

        tx
    }

    /// The output spent by the slashing transaction of `kind`.
    pub fn slashed_output(&self, kind: SlashingTxKind) -> TxOut {
        match kind {
            SlashingTxKind::StakingSlashing => self.delegation.staking_tx.output[0].clone(),
            SlashingTxKind::UnbondingSlashing => self
                .delegation
                .unbonding_output()
                .expect("fixture must be unbonded")
                .clone(),
        }
    }
}

/// Builds equivocation evidence: `fp_sk` voting for two different blocks at `height` with the
/// same randomness.
pub fn generate_evidence(fp_sk: &SecretKey, height: u64) -> Evidence {
    let sec_rand = generate_secret_key();
    let canonical_app_hash = generate_secret_key().secret_bytes().to_vec();
    let fork_app_hash = generate_secret_key().secret_bytes().to_vec();

    Evidence {
        fp_btc_pk: fp_sk.x_only_public_key(SECP256K1).0,
        block_height: height,
        pub_rand: eots::pub_rand(&sec_rand),
        canonical_finality_sig: eots::sign(
            fp_sk,
            &sec_rand,
            &eots::msg_to_sign(height, &canonical_app_hash),
        ),
        fork_finality_sig: eots::sign(
            fp_sk,
            &sec_rand,
            &eots::msg_to_sign(height, &fork_app_hash),
        ),
        canonical_app_hash,
        fork_app_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covenant_sigs_verify() {
        let committee = CovenantCommittee::new(3, 2);
        let fixture = DelegationFixture::new(&committee, generate_secret_keys(2), false);
        let path = fixture.slashing_path();
        let sighash = path
            .slashing_sighash(
                &fixture.delegation.slashing_tx,
                &fixture.slashed_output(SlashingTxKind::StakingSlashing),
            )
            .unwrap();

        for cov in &fixture.delegation.covenant_sigs {
            for (idx, fp_pk) in fixture.delegation.fp_btc_pk_list.iter().enumerate() {
                let asig = cov.adaptor_sig(idx).unwrap().unwrap();
                asig.verify(&cov.cov_pk, fp_pk, &sighash).unwrap();
            }
        }
    }

    #[test]
    fn selectively_slashed_tx_has_full_witness() {
        let committee = CovenantCommittee::new(3, 2);
        let fixture = DelegationFixture::new(&committee, generate_secret_keys(1), true);

        for kind in [SlashingTxKind::StakingSlashing, SlashingTxKind::UnbondingSlashing] {
            let tx = fixture.selectively_slashed_tx(0, kind);
            // 3 covenant slots, 1 fp slot, delegator, script, control block
            assert_eq!(tx.input[0].witness.len(), 7);
        }
    }
}
