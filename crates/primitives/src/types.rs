//! Chain-side records of the staking protocol as the watcher consumes them.

use bitcoin::{Amount, Transaction, TxOut, Txid};
use secp256k1::{schnorr, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};

use crate::{
    adaptor::AdaptorSignature,
    eots::{self, EotsSignature, PubRand},
    errors::{AdaptorSigError, EotsError},
    scripts::SlashingPath,
    secp::EvenSecretKey,
};

/// Which output a slashing transaction spends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlashingTxKind {
    /// Spends the staking output.
    StakingSlashing,

    /// Spends the output of the on-demand unbonding transaction.
    UnbondingSlashing,
}

/// Status of a delegation as reported by the staking chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BtcDelegationStatus {
    /// Waiting for covenant signatures.
    Pending,

    /// Covenant signatures collected, staking tx not yet included on Bitcoin.
    Verified,

    /// Has voting power.
    Active,

    /// The delegator unbonded early.
    Unbonded,

    /// The staking time lock is about to expire.
    Expired,
}

/// The covenant adaptor signatures of one covenant member over one slashing transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovenantAdaptorSignatures {
    /// The covenant member.
    pub cov_pk: XOnlyPublicKey,

    /// One encoded adaptor signature per finality provider, in the delegation's finality provider
    /// order, each encrypted under that provider's key.
    #[serde(with = "hex_list")]
    pub adaptor_sigs: Vec<Vec<u8>>,
}

impl CovenantAdaptorSignatures {
    /// Parses the adaptor signature targeted at the finality provider at `fp_idx`.
    pub fn adaptor_sig(&self, fp_idx: usize) -> Option<Result<AdaptorSignature, AdaptorSigError>> {
        self.adaptor_sigs
            .get(fp_idx)
            .map(|bytes| AdaptorSignature::from_bytes(bytes))
    }
}

/// The on-demand unbonding of a delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcUndelegation {
    /// The unbonding transaction spending the staking output.
    pub unbonding_tx: Transaction,

    /// The pre-signed slashing transaction spending the unbonding output.
    pub slashing_tx: Transaction,

    /// The delegator's signature over the unbonding slashing transaction.
    pub delegator_slashing_sig: schnorr::Signature,

    /// Covenant adaptor signatures over the unbonding slashing transaction.
    pub covenant_slashing_sigs: Vec<CovenantAdaptorSignatures>,

    /// Set once the delegator has signed the unbonding transaction.
    pub delegator_unbonding_sig: Option<schnorr::Signature>,
}

/// A BTC delegation as recorded on the staking chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcDelegation {
    /// The delegator's key.
    pub staker_pk: XOnlyPublicKey,

    /// The finality providers this delegation is restaked to.
    pub fp_btc_pk_list: Vec<XOnlyPublicKey>,

    /// Relative time lock of the staking output.
    pub staking_time: u16,

    /// Relative time lock of the unbonding output.
    pub unbonding_time: u16,

    /// The staked amount.
    pub total_sat: Amount,

    /// The staking transaction.
    pub staking_tx: Transaction,

    /// Index of the staking output in the staking transaction.
    pub staking_output_idx: u32,

    /// The pre-signed slashing transaction spending the staking output.
    pub slashing_tx: Transaction,

    /// The delegator's signature over the slashing transaction.
    pub delegator_slashing_sig: schnorr::Signature,

    /// Covenant adaptor signatures over the slashing transaction.
    pub covenant_sigs: Vec<CovenantAdaptorSignatures>,

    /// Present once the delegator requested on-demand unbonding.
    pub undelegation: Option<BtcUndelegation>,

    /// The chain's view of the delegation.
    pub status: BtcDelegationStatus,

    /// Version of the staking parameters the delegation was created under.
    pub params_version: u32,
}

impl BtcDelegation {
    /// The identifier of the delegation.
    pub fn staking_tx_hash(&self) -> Txid {
        self.staking_tx.compute_txid()
    }

    /// The staking output.
    pub fn staking_output(&self) -> Option<&TxOut> {
        self.staking_tx.output.get(self.staking_output_idx as usize)
    }

    /// The unbonding output, if the delegation has been unbonded.
    pub fn unbonding_output(&self) -> Option<&TxOut> {
        self.undelegation
            .as_ref()
            .and_then(|u| u.unbonding_tx.output.first())
    }

    /// Position of `fp_pk` in the delegation's finality provider list.
    pub fn fp_index(&self, fp_pk: &XOnlyPublicKey) -> Option<usize> {
        self.fp_btc_pk_list.iter().position(|pk| pk == fp_pk)
    }

    /// The slashing path this delegation was created with.
    pub fn slashing_path(&self, params: &StakingParams) -> SlashingPath {
        SlashingPath {
            staker_pk: self.staker_pk,
            fp_pks: self.fp_btc_pk_list.clone(),
            covenant_pks: params.covenant_pks.clone(),
            covenant_quorum: params.covenant_quorum,
            staking_time: self.staking_time,
            unbonding_time: self.unbonding_time,
        }
    }
}

/// Versioned staking parameters of the staking chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingParams {
    /// The version these parameters were activated as.
    pub version: u32,

    /// The covenant committee.
    pub covenant_pks: Vec<XOnlyPublicKey>,

    /// Number of covenant signatures needed to spend via the covenant paths.
    pub covenant_quorum: u32,
}

/// Checkpointing parameters of the staking chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointParams {
    /// Bitcoin confirmations after which a checkpoint is considered confirmed.
    pub btc_confirmation_depth: u32,

    /// Bitcoin confirmations after which a checkpoint is considered final.
    pub checkpoint_finalization_timeout: u32,
}

/// Evidence of a finality provider signing two conflicting blocks at the same height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// The equivocating finality provider.
    pub fp_btc_pk: XOnlyPublicKey,

    /// The height both votes are for.
    pub block_height: u64,

    /// The public randomness committed for that height.
    pub pub_rand: PubRand,

    /// The block of the canonical chain.
    #[serde(with = "hex::serde")]
    pub canonical_app_hash: Vec<u8>,

    /// The conflicting block.
    #[serde(with = "hex::serde")]
    pub fork_app_hash: Vec<u8>,

    /// The vote for the canonical block.
    pub canonical_finality_sig: EotsSignature,

    /// The vote for the conflicting block.
    pub fork_finality_sig: EotsSignature,
}

impl Evidence {
    /// Recovers the finality provider's BTC secret key from the two votes.
    pub fn extract_btc_sk(&self) -> Result<EvenSecretKey, EotsError> {
        eots::extract(
            &self.fp_btc_pk,
            &self.pub_rand,
            &eots::msg_to_sign(self.block_height, &self.canonical_app_hash),
            &self.canonical_finality_sig,
            &eots::msg_to_sign(self.block_height, &self.fork_app_hash),
            &self.fork_finality_sig,
        )
    }
}

/// A report that a finality provider's key leaked through a slashing transaction that the staking
/// chain never authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectiveSlashingEvidence {
    /// The delegation that was slashed.
    pub staking_tx_hash: Txid,

    /// The finality provider whose key leaked.
    pub fp_btc_pk: XOnlyPublicKey,

    /// The recovered key.
    pub recovered_fp_btc_sk: SecretKey,
}

mod hex_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(items.iter().map(hex::encode))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
