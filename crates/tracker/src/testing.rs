//! In-memory collaborators shared by the tests of this crate.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{Block, OutPoint, Transaction, TxOut, Txid};
use btcstaking_primitives::types::{
    BtcDelegation, BtcDelegationStatus, CheckpointParams, Evidence, StakingParams,
};
use parking_lot::Mutex;
use secp256k1::{SecretKey, XOnlyPublicKey};
use tokio::sync::mpsc;

use crate::{
    clients::{BitcoinClient, ChainAdapter, ChainEvent},
    errors::ClientError,
    subscription::{self, Subscription},
};

/// Polls `cond` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(polled.is_ok(), "condition not reached in time");
}

/// A staking chain held in memory.
#[derive(Debug)]
pub(crate) struct FakeChain {
    pub(crate) params: Vec<StakingParams>,
    pub(crate) fail_params: AtomicBool,
    pub(crate) fail_subscribe: AtomicBool,
    /// Makes the delegation and evidence queries hang forever.
    pub(crate) stall_queries: AtomicBool,
    pub(crate) stalled_calls: AtomicUsize,
    pub(crate) delegations: Mutex<BTreeMap<Txid, BtcDelegation>>,
    pub(crate) subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<ChainEvent>)>>,
    pub(crate) unsubscribe_calls: AtomicUsize,
    pub(crate) reports: Mutex<Vec<(Txid, SecretKey)>>,
    pub(crate) slashed_fps: Mutex<BTreeSet<XOnlyPublicKey>>,
    pub(crate) evidences: Mutex<Vec<Evidence>>,
}

impl FakeChain {
    pub(crate) fn new(params: StakingParams) -> Self {
        Self {
            params: vec![params],
            fail_params: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            stall_queries: AtomicBool::new(false),
            stalled_calls: AtomicUsize::new(0),
            delegations: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscribe_calls: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
            slashed_fps: Mutex::new(BTreeSet::new()),
            evidences: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_delegation(&self, delegation: BtcDelegation) {
        self.delegations
            .lock()
            .insert(delegation.staking_tx_hash(), delegation);
    }

    /// Pushes `event` to every subscription created with `query`.
    pub(crate) fn emit(&self, query: &str, event: ChainEvent) {
        for (q, sender) in self.subscriptions.lock().iter() {
            if q == query {
                let _ = sender.send(event.clone());
            }
        }
    }

    async fn maybe_stall(&self) {
        if self.stall_queries.load(Ordering::SeqCst) {
            self.stalled_calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    fn by_status(&self, status: BtcDelegationStatus) -> Vec<BtcDelegation> {
        self.delegations
            .lock()
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    async fn btc_checkpoint_params(&self) -> Result<CheckpointParams, ClientError> {
        match self.fail_params.load(Ordering::SeqCst) {
            true => Err(ClientError::Request("params unavailable".to_string())),
            false => Ok(CheckpointParams {
                btc_confirmation_depth: 6,
                checkpoint_finalization_timeout: 100,
            }),
        }
    }

    async fn all_btc_staking_params(&self) -> Result<Vec<StakingParams>, ClientError> {
        match self.fail_params.load(Ordering::SeqCst) {
            true => Err(ClientError::Request("params unavailable".to_string())),
            false => Ok(self.params.clone()),
        }
    }

    async fn btc_staking_params(&self, version: u32) -> Result<StakingParams, ClientError> {
        self.params
            .iter()
            .find(|p| p.version == version)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("params version {version}")))
    }

    async fn btc_delegations(
        &self,
        status: BtcDelegationStatus,
    ) -> Result<Vec<BtcDelegation>, ClientError> {
        Ok(self.by_status(status))
    }

    async fn btc_delegation(
        &self,
        staking_tx_hash: &Txid,
    ) -> Result<Option<BtcDelegation>, ClientError> {
        Ok(self.delegations.lock().get(staking_tx_hash).cloned())
    }

    async fn active_and_unbonded_delegations(
        &self,
        fp_pk: &XOnlyPublicKey,
    ) -> Result<(Vec<BtcDelegation>, Vec<BtcDelegation>), ClientError> {
        self.maybe_stall().await;

        let restaked = |status| {
            self.by_status(status)
                .into_iter()
                .filter(|d| d.fp_btc_pk_list.contains(fp_pk))
                .collect::<Vec<_>>()
        };

        Ok((
            restaked(BtcDelegationStatus::Active),
            restaked(BtcDelegationStatus::Unbonded),
        ))
    }

    async fn subscribe(
        &self,
        _subscriber: &str,
        query: &str,
    ) -> Result<Subscription<ChainEvent>, ClientError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ClientError::Subscription("refused".to_string()));
        }

        let (sender, sub) = subscription::channel();
        self.subscriptions.lock().push((query.to_string(), sender));
        Ok(sub)
    }

    async fn unsubscribe_all(&self, _subscriber: &str) -> Result<(), ClientError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().clear();
        Ok(())
    }

    async fn report_selective_slashing(
        &self,
        staking_tx_hash: &Txid,
        recovered_sk: &SecretKey,
    ) -> Result<(), ClientError> {
        self.reports.lock().push((*staking_tx_hash, *recovered_sk));
        Ok(())
    }

    async fn is_finality_provider_slashed(
        &self,
        fp_pk: &XOnlyPublicKey,
    ) -> Result<bool, ClientError> {
        Ok(self.slashed_fps.lock().contains(fp_pk))
    }

    async fn list_evidences(&self, _start_height: u64) -> Result<Vec<Evidence>, ClientError> {
        self.maybe_stall().await;
        Ok(self.evidences.lock().clone())
    }
}

/// A Bitcoin node held in memory that records how many calls are in flight at once.
#[derive(Debug, Default)]
pub(crate) struct FakeBitcoin {
    pub(crate) txs: Mutex<BTreeMap<Txid, Transaction>>,
    pub(crate) utxos: Mutex<BTreeMap<OutPoint, TxOut>>,
    pub(crate) sent: Mutex<Vec<Transaction>>,
    pub(crate) block_subs: Mutex<Vec<mpsc::UnboundedSender<Block>>>,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) max_in_flight: AtomicUsize,
    pub(crate) latency: Duration,
}

impl FakeBitcoin {
    pub(crate) fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    /// Makes the outputs of `delegation` visible: the staking output, or the unbonding output if
    /// the delegation unbonded.
    pub(crate) fn fund(&self, delegation: &BtcDelegation) {
        let staking_tx = &delegation.staking_tx;
        self.txs
            .lock()
            .insert(staking_tx.compute_txid(), staking_tx.clone());

        match &delegation.undelegation {
            Some(undelegation) => {
                let unbonding_tx = &undelegation.unbonding_tx;
                self.txs
                    .lock()
                    .insert(unbonding_tx.compute_txid(), unbonding_tx.clone());
                self.utxos.lock().insert(
                    OutPoint::new(unbonding_tx.compute_txid(), 0),
                    unbonding_tx.output[0].clone(),
                );
            }
            None => {
                self.utxos.lock().insert(
                    OutPoint::new(staking_tx.compute_txid(), delegation.staking_output_idx),
                    staking_tx.output[delegation.staking_output_idx as usize].clone(),
                );
            }
        }
    }

    pub(crate) fn mine(&self, block: Block) {
        self.block_subs
            .lock()
            .retain(|sub| sub.send(block.clone()).is_ok());
    }

    async fn call<T>(&self, f: impl FnOnce() -> T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let res = f();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

#[async_trait]
impl BitcoinClient for FakeBitcoin {
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ClientError> {
        self.call(|| Ok(self.txs.lock().get(txid).cloned())).await
    }

    async fn get_tx_out(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, ClientError> {
        self.call(|| Ok(self.utxos.lock().get(outpoint).cloned()))
            .await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, ClientError> {
        self.call(|| {
            let mut utxos = self.utxos.lock();
            for input in &tx.input {
                if utxos.remove(&input.previous_output).is_none() {
                    return Err(ClientError::Request("missing inputs".to_string()));
                }
            }

            let txid = tx.compute_txid();
            self.txs.lock().insert(txid, tx.clone());
            self.sent.lock().push(tx.clone());
            Ok(txid)
        })
        .await
    }

    async fn subscribe_blocks(&self) -> Result<Subscription<Block>, ClientError> {
        let (sender, sub) = subscription::channel();
        self.block_subs.lock().push(sender);
        Ok(sub)
    }
}
