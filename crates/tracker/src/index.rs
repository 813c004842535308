//! In-memory index of the delegations the atomic slasher watches.
//!
//! Besides the primary map from staking tx hash to delegation, the index keeps a derived map from
//! the txid of every pre-signed slashing transaction to the delegation it slashes. A transaction
//! seen on Bitcoin can therefore be recognized as a slashing spend with a single lookup of its
//! txid. Witness data does not affect txids, so the lookup works for the completed transaction
//! as well.

use std::collections::BTreeMap;

use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use btcstaking_primitives::{
    scripts::SlashingPath,
    types::{
        BtcDelegation, BtcDelegationStatus, CovenantAdaptorSignatures, SlashingTxKind,
        StakingParams,
    },
};
use parking_lot::RwLock;

use crate::witness::SlashingTxInfo;

/// Status of a delegation as far as the tracker is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedStatus {
    /// The staking output is expected to be unspent.
    Active,

    /// The delegation was unbonded on demand; the unbonding output can still be slashed.
    Unbonded,

    /// A slashing tx of the delegation was seen on Bitcoin.
    Slashed,
}

/// A delegation under observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDelegation {
    /// The chain-side record.
    pub delegation: BtcDelegation,

    /// The slashing path, derived from the parameters the delegation was created under.
    pub slashing_path: SlashingPath,

    /// The tracker's view of the delegation.
    pub status: TrackedStatus,
}

impl TrackedDelegation {
    /// Starts tracking `delegation`, created under `params`.
    pub fn new(delegation: BtcDelegation, params: &StakingParams) -> Self {
        let status = match delegation.status {
            BtcDelegationStatus::Unbonded => TrackedStatus::Unbonded,
            _ => TrackedStatus::Active,
        };

        Self {
            slashing_path: delegation.slashing_path(params),
            delegation,
            status,
        }
    }

    /// The identifier of the delegation.
    pub fn staking_tx_hash(&self) -> Txid {
        self.delegation.staking_tx_hash()
    }

    /// The pre-signed slashing transaction of `kind`.
    pub fn slashing_tx(&self, kind: SlashingTxKind) -> Option<&Transaction> {
        match kind {
            SlashingTxKind::StakingSlashing => Some(&self.delegation.slashing_tx),
            SlashingTxKind::UnbondingSlashing => {
                self.delegation.undelegation.as_ref().map(|u| &u.slashing_tx)
            }
        }
    }

    /// The covenant adaptor signatures over the slashing transaction of `kind`.
    pub fn covenant_sigs(&self, kind: SlashingTxKind) -> Option<&[CovenantAdaptorSignatures]> {
        match kind {
            SlashingTxKind::StakingSlashing => Some(&self.delegation.covenant_sigs),
            SlashingTxKind::UnbondingSlashing => self
                .delegation
                .undelegation
                .as_ref()
                .map(|u| u.covenant_slashing_sigs.as_slice()),
        }
    }

    /// The output spent by the slashing transaction of `kind`, with its outpoint.
    pub fn funding_output(&self, kind: SlashingTxKind) -> Option<(OutPoint, TxOut)> {
        match kind {
            SlashingTxKind::StakingSlashing => {
                let vout = self.delegation.staking_output_idx;
                self.delegation
                    .staking_output()
                    .map(|out| (OutPoint::new(self.staking_tx_hash(), vout), out.clone()))
            }
            SlashingTxKind::UnbondingSlashing => {
                let undelegation = self.delegation.undelegation.as_ref()?;
                undelegation.unbonding_tx.output.first().map(|out| {
                    (
                        OutPoint::new(undelegation.unbonding_tx.compute_txid(), 0),
                        out.clone(),
                    )
                })
            }
        }
    }

    /// Prepares the classification of `tx` as the slashing transaction of `kind`.
    pub fn slashing_tx_info(
        &self,
        kind: SlashingTxKind,
        tx: Transaction,
    ) -> Option<SlashingTxInfo> {
        let (funding_outpoint, funding_output) = self.funding_output(kind)?;

        Some(SlashingTxInfo::new(
            kind,
            self.slashing_path.clone(),
            self.staking_tx_hash(),
            funding_outpoint,
            funding_output,
            tx,
        ))
    }

    fn slashing_txids(&self) -> Vec<(Txid, SlashingTxKind)> {
        [SlashingTxKind::StakingSlashing, SlashingTxKind::UnbondingSlashing]
            .into_iter()
            .filter_map(|kind| self.slashing_tx(kind).map(|tx| (tx.compute_txid(), kind)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct IndexInner {
    delegations: BTreeMap<Txid, TrackedDelegation>,
    slashing_txs: BTreeMap<Txid, (Txid, SlashingTxKind)>,
}

impl IndexInner {
    fn remove(&mut self, staking_tx_hash: &Txid) -> Option<TrackedDelegation> {
        let removed = self.delegations.remove(staking_tx_hash)?;
        for (txid, _) in removed.slashing_txids() {
            self.slashing_txs.remove(&txid);
        }
        Some(removed)
    }
}

/// Concurrent index of tracked delegations.
///
/// Both maps live behind one lock, so every entry of the derived map points to a live delegation
/// at all times and lookups never observe a half-applied update.
#[derive(Debug, Default)]
pub struct DelegationIndex {
    inner: RwLock<IndexInner>,
}

impl DelegationIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the delegation keyed by its staking tx hash.
    pub fn add(&self, delegation: TrackedDelegation) {
        let staking_tx_hash = delegation.staking_tx_hash();
        let slashing_txids = delegation.slashing_txids();

        let mut inner = self.inner.write();
        inner.remove(&staking_tx_hash);
        for (txid, kind) in slashing_txids {
            inner.slashing_txs.insert(txid, (staking_tx_hash, kind));
        }
        inner.delegations.insert(staking_tx_hash, delegation);
    }

    /// Looks up a delegation by its staking tx hash.
    pub fn get(&self, staking_tx_hash: &Txid) -> Option<TrackedDelegation> {
        self.inner.read().delegations.get(staking_tx_hash).cloned()
    }

    /// Stops tracking a delegation. Does nothing if it is not tracked.
    pub fn remove(&self, staking_tx_hash: &Txid) -> Option<TrackedDelegation> {
        self.inner.write().remove(staking_tx_hash)
    }

    /// Finds the delegation slashed by the transaction with the given txid, and which of its
    /// slashing transactions it is.
    pub fn find_slashed_btc_delegation(
        &self,
        txid: &Txid,
    ) -> Option<(TrackedDelegation, SlashingTxKind)> {
        let inner = self.inner.read();
        let (staking_tx_hash, kind) = inner.slashing_txs.get(txid)?;
        let delegation = inner.delegations.get(staking_tx_hash)?;

        Some((delegation.clone(), *kind))
    }

    /// Updates the status of a tracked delegation. Returns `false` if it is not tracked.
    pub fn set_status(&self, staking_tx_hash: &Txid, status: TrackedStatus) -> bool {
        match self.inner.write().delegations.get_mut(staking_tx_hash) {
            Some(delegation) => {
                delegation.status = status;
                true
            }
            None => false,
        }
    }

    /// Number of tracked delegations.
    pub fn len(&self) -> usize {
        self.inner.read().delegations.len()
    }

    /// Whether no delegation is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().delegations.is_empty()
    }

    /// The staking tx hashes of all tracked delegations.
    pub fn staking_tx_hashes(&self) -> Vec<Txid> {
        self.inner.read().delegations.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use btcstaking_test_utils::{
        bitcoin::{generate_secret_keys, generate_tx},
        staking::{CovenantCommittee, DelegationFixture},
    };

    use super::*;

    fn tracked(committee: &CovenantCommittee, unbonded: bool) -> TrackedDelegation {
        let fixture = DelegationFixture::new(committee, generate_secret_keys(2), unbonded);
        TrackedDelegation::new(fixture.delegation, &committee.params)
    }

    #[test]
    fn get_returns_delegation_until_removed() {
        let committee = CovenantCommittee::new(3, 2);
        let index = DelegationIndex::new();
        let del = tracked(&committee, false);
        let hash = del.staking_tx_hash();
        let slashing_txid = del.delegation.slashing_tx.compute_txid();

        index.add(del.clone());
        assert_eq!(index.get(&hash), Some(del.clone()));
        assert_eq!(
            index.find_slashed_btc_delegation(&slashing_txid),
            Some((del, SlashingTxKind::StakingSlashing))
        );

        assert!(index.remove(&hash).is_some());
        assert!(index.get(&hash).is_none());
        assert!(index.find_slashed_btc_delegation(&slashing_txid).is_none());
        assert!(index.is_empty());

        // removing again is a no-op
        assert!(index.remove(&hash).is_none());
    }

    #[test]
    fn unbonding_slashing_tx_is_recognized() {
        let committee = CovenantCommittee::new(3, 2);
        let index = DelegationIndex::new();
        let del = tracked(&committee, true);
        let unbonding_slashing_txid = del
            .slashing_tx(SlashingTxKind::UnbondingSlashing)
            .unwrap()
            .compute_txid();

        index.add(del.clone());

        let (found, kind) = index
            .find_slashed_btc_delegation(&unbonding_slashing_txid)
            .unwrap();
        assert_eq!(found.staking_tx_hash(), del.staking_tx_hash());
        assert_eq!(kind, SlashingTxKind::UnbondingSlashing);
        assert_eq!(found.status, TrackedStatus::Unbonded);
    }

    #[test]
    fn unrelated_tx_is_not_found() {
        let committee = CovenantCommittee::new(3, 2);
        let index = DelegationIndex::new();
        index.add(tracked(&committee, false));

        let unrelated = generate_tx(1, 1).compute_txid();
        assert!(index.find_slashed_btc_delegation(&unrelated).is_none());
    }

    #[test]
    fn replacing_drops_stale_derived_entries() {
        let committee = CovenantCommittee::new(3, 2);
        let index = DelegationIndex::new();
        let unbonded = tracked(&committee, true);
        let hash = unbonded.staking_tx_hash();
        let stale_txid = unbonded
            .slashing_tx(SlashingTxKind::UnbondingSlashing)
            .unwrap()
            .compute_txid();

        index.add(unbonded.clone());

        let mut active = unbonded;
        active.delegation.undelegation = None;
        active.status = TrackedStatus::Active;
        index.add(active.clone());
        index.add(active);

        assert_eq!(index.len(), 1);
        assert!(index.find_slashed_btc_delegation(&stale_txid).is_none());
        assert_eq!(index.staking_tx_hashes(), vec![hash]);
    }

    #[test]
    fn set_status_only_touches_tracked_delegations() {
        let committee = CovenantCommittee::new(3, 2);
        let index = DelegationIndex::new();
        let del = tracked(&committee, false);
        let hash = del.staking_tx_hash();
        index.add(del);

        assert!(index.set_status(&hash, TrackedStatus::Slashed));
        assert_eq!(index.get(&hash).unwrap().status, TrackedStatus::Slashed);
        assert!(!index.set_status(&generate_tx(1, 1).compute_txid(), TrackedStatus::Slashed));
    }
}
