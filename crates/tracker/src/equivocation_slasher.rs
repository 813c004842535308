//! Slashing of finality providers that equivocated.
//!
//! An equivocating finality provider signs two conflicting blocks at the same height with the same
//! EOTS randomness, which leaks its BTC key. The staking chain emits the evidence; the
//! [`EquivocationSlasher`] extracts the key from it and uses it to complete and broadcast the
//! pre-signed slashing transactions of every delegation restaked to the provider.
//!
//! Keys recovered elsewhere, e.g. by the [`AtomicSlasher`](crate::atomic_slasher::AtomicSlasher),
//! enter the same pipeline through [`EquivocationSlasher::key_sender`].

use std::{collections::BTreeSet, sync::Arc};

use bitcoin::{Amount, OutPoint, Txid};
use btcstaking_primitives::types::{BtcDelegation, CheckpointParams, SlashingTxKind, StakingParams};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use secp256k1::{SecretKey, XOnlyPublicKey, SECP256K1};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{BitcoinClient, ChainAdapter, ChainEvent},
    config::TrackerConfig,
    constants::{CONSUMER_EVIDENCE_QUERY, EQUIVOCATION_SUBSCRIBER, SAME_CHAIN_EVIDENCE_QUERY},
    errors::{ClientError, SlashingError, TrackerError},
    lifecycle::{Lifecycle, LifecycleState},
    metrics::SlasherMetrics,
    params::ParamsCache,
    retry::{retry, RetryPolicy},
    secret::SecretKeyHolder,
    slashing_tx::build_slashing_tx_with_witness,
    subscription::Subscription,
};

/// Outcome of slashing one delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashResult {
    /// The slashed delegation.
    pub staking_tx_hash: Txid,

    /// The finality provider the key belongs to.
    pub fp_btc_pk: XOnlyPublicKey,

    /// Stake of the delegation.
    pub total_sat: Amount,

    /// Whether a slashing tx of the delegation is on Bitcoin now.
    pub result: Result<(), SlashingError>,
}

#[derive(Debug)]
struct Shared {
    config: TrackerConfig,
    chain: Arc<dyn ChainAdapter>,
    btc: Arc<dyn BitcoinClient>,
    params: ParamsCache,
    checkpoint_params: Mutex<Option<CheckpointParams>>,
    metrics: SlasherMetrics,
    slashed_fps: Mutex<BTreeSet<XOnlyPublicKey>>,
    limiter: Semaphore,
}

/// Slashes every delegation of finality providers whose key leaked.
#[derive(Debug)]
pub struct EquivocationSlasher {
    shared: Arc<Shared>,
    key_tx: mpsc::Sender<SecretKey>,
    key_rx: Mutex<Option<mpsc::Receiver<SecretKey>>>,
    result_sink: Option<mpsc::UnboundedSender<SlashResult>>,
    lifecycle: Lifecycle,
}

impl EquivocationSlasher {
    /// Creates a slasher that is not started yet.
    pub fn new(
        config: TrackerConfig,
        chain: Arc<dyn ChainAdapter>,
        btc: Arc<dyn BitcoinClient>,
        metrics: SlasherMetrics,
    ) -> Self {
        let (key_tx, key_rx) = mpsc::channel(config.slashing_key_buffer.max(1));

        Self {
            shared: Arc::new(Shared {
                limiter: Semaphore::new(config.max_slashing_concurrency),
                config,
                params: ParamsCache::new(chain.clone()),
                chain,
                btc,
                checkpoint_params: Mutex::new(None),
                metrics,
                slashed_fps: Mutex::new(BTreeSet::new()),
            }),
            key_tx,
            key_rx: Mutex::new(Some(key_rx)),
            result_sink: None,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Forwards the outcome of every delegation slashing to `sink` after recording it.
    pub fn with_result_sink(mut self, sink: mpsc::UnboundedSender<SlashResult>) -> Self {
        self.result_sink = Some(sink);
        self
    }

    /// A handle to feed recovered finality provider keys into the enforcer.
    pub fn key_sender(&self) -> mpsc::Sender<SecretKey> {
        self.key_tx.clone()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Bitcoin confirmations after which a checkpoint is final, once [`Self::load_params`] ran.
    ///
    /// Callers use it to pick the start height of [`Self::bootstrap`].
    pub fn finalization_timeout(&self) -> Option<u32> {
        self.shared
            .checkpoint_params
            .lock()
            .as_ref()
            .map(|p| p.checkpoint_finalization_timeout)
    }

    /// Loads the checkpoint and staking parameters unless they are cached already.
    pub async fn load_params(&self) -> Result<(), ClientError> {
        if self.shared.checkpoint_params.lock().is_none() {
            let params = self.shared.chain.btc_checkpoint_params().await?;
            debug!(finalization_timeout = %params.checkpoint_finalization_timeout, "loaded checkpoint parameters");
            *self.shared.checkpoint_params.lock() = Some(params);
        }

        self.shared.params.load_all().await
    }

    /// Loads the parameters, subscribes to evidence events and launches the workers.
    ///
    /// Starting twice, or after [`Self::stop`], does nothing.
    pub async fn start(&self) -> Result<(), TrackerError> {
        self.shared.config.validate()?;

        if !self.lifecycle.begin_start() {
            debug!(state = ?self.state(), "equivocation slasher already started");
            return Ok(());
        }

        if let Err(e) = self.load_params().await {
            self.lifecycle.abort_start();
            return Err(TrackerError::Params(e));
        }

        let chain = &self.shared.chain;
        let same_chain = match chain
            .subscribe(EQUIVOCATION_SUBSCRIBER, SAME_CHAIN_EVIDENCE_QUERY)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(TrackerError::Subscribe(e));
            }
        };

        let consumer = match chain
            .subscribe(EQUIVOCATION_SUBSCRIBER, CONSUMER_EVIDENCE_QUERY)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                self.unsubscribe().await;
                self.lifecycle.abort_start();
                return Err(TrackerError::Subscribe(e));
            }
        };

        let spawned = self.lifecycle.commit_start(|tasks, cancel| {
            let Some(key_rx) = self.key_rx.lock().take() else {
                error!("slashing key receiver already taken");
                return;
            };

            tasks.spawn(equivocation_tracker(
                self.shared.clone(),
                same_chain,
                consumer,
                self.key_tx.clone(),
                cancel.clone(),
            ));
            tasks.spawn(slashing_enforcer(
                self.shared.clone(),
                key_rx,
                self.result_sink.clone(),
                tasks.clone(),
                cancel.clone(),
            ));
        });

        match spawned {
            true => info!("equivocation slasher started"),
            false => {
                debug!("equivocation slasher stopped while starting");
                self.unsubscribe().await;
            }
        }

        Ok(())
    }

    /// Slashes the finality providers of every evidence recorded since `start_height`.
    ///
    /// Meant to be called after [`Self::start`], to catch up on evidence emitted while the slasher
    /// was not running.
    pub async fn bootstrap(&self, start_height: u64) -> Result<(), TrackerError> {
        let evidences = tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => {
                debug!(%start_height, "slasher stopped before evidence was listed");
                return Ok(());
            }
            evidences = self.shared.chain.list_evidences(start_height) => {
                evidences.map_err(TrackerError::Bootstrap)?
            }
        };
        info!(%start_height, evidences = %evidences.len(), "bootstrapping from historical evidence");

        for evidence in evidences {
            let event = ChainEvent {
                height: evidence.block_height,
                evidence: Some(evidence),
            };

            let Some(sk) = self.shared.handle_evidence(&event, false) else {
                continue;
            };

            tokio::select! {
                biased;
                _ = self.lifecycle.cancelled() => break,
                res = self.key_tx.send(sk) => {
                    if res.is_err() {
                        warn!("slashing enforcer exited, stopping bootstrap");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolves once the slasher was stopped and every task exited.
    pub async fn wait_for_shutdown(&self) {
        self.lifecycle.cancelled().await;
        self.lifecycle.shutdown().await;
    }

    /// Unsubscribes from evidence events, signals every task to quit and waits for them to exit.
    /// Idempotent.
    pub async fn stop(&self) {
        match self.lifecycle.begin_stop() {
            Some(LifecycleState::Running) => {
                info!("stopping equivocation slasher");
                self.unsubscribe().await;
            }
            Some(prev) => info!(?prev, "stopping equivocation slasher"),
            None => {}
        }

        self.lifecycle.shutdown().await;
        debug!("equivocation slasher tasks exited");
    }

    async fn unsubscribe(&self) {
        if let Err(e) = self.shared.chain.unsubscribe_all(EQUIVOCATION_SUBSCRIBER).await {
            warn!(%e, "failed to unsubscribe from evidence events");
        }
    }
}

impl Shared {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    /// Extracts the key of the equivocating finality provider, unless it is slashed already.
    fn handle_evidence(&self, event: &ChainEvent, is_consumer: bool) -> Option<SecretKey> {
        let evidence = event.evidence.as_ref()?;
        let fp_pk = evidence.fp_btc_pk;
        let height = evidence.block_height;

        if self.slashed_fps.lock().contains(&fp_pk) {
            debug!(%fp_pk, %height, "finality provider already slashed, ignoring evidence");
            return None;
        }

        match evidence.extract_btc_sk() {
            Ok(sk) => {
                info!(%fp_pk, %height, %is_consumer, "extracted key of equivocating finality provider");
                Some(sk.into_inner())
            }
            Err(e) => {
                error!(%fp_pk, %height, %is_consumer, %e, "failed to extract key from evidence");
                None
            }
        }
    }

    async fn is_tx_submitted_to_bitcoin(&self, txid: &Txid) -> Result<bool, ClientError> {
        Ok(self.btc.get_raw_transaction(txid).await?.is_some())
    }

    async fn is_taproot_output_spendable(&self, outpoint: &OutPoint) -> Result<bool, ClientError> {
        Ok(self.btc.get_tx_out(outpoint).await?.is_some())
    }

    /// Looks up the delegations of the provider owning `sk` and spawns one slashing task each.
    async fn slash_finality_provider(
        self: &Arc<Self>,
        sk: SecretKey,
        tasks: &TaskTracker,
        results: &mpsc::UnboundedSender<SlashResult>,
        cancel: &CancellationToken,
    ) {
        let fp_pk = sk.x_only_public_key(SECP256K1).0;
        if !self.slashed_fps.lock().insert(fp_pk) {
            debug!(%fp_pk, "finality provider already slashed");
            return;
        }

        let sk = Arc::new(SecretKeyHolder::new(sk));

        let (active, unbonded) = match retry(
            self.retry_policy(),
            cancel,
            "active_and_unbonded_delegations",
            || self.chain.active_and_unbonded_delegations(&fp_pk),
        )
        .await
        {
            Ok(delegations) => delegations,
            Err(e) => {
                error!(%fp_pk, %e, "failed to fetch delegations of finality provider");
                self.slashed_fps.lock().remove(&fp_pk);
                return;
            }
        };

        let mut targets = active;
        for delegation in unbonded {
            if self.has_unbonding_quorum(&delegation).await {
                targets.push(delegation);
            } else {
                debug!(staking_tx_hash = %delegation.staking_tx_hash(), %fp_pk, "unbonded delegation lacks covenant slashing signatures, skipping");
            }
        }

        info!(%fp_pk, delegations = %targets.len(), "slashing finality provider");

        for delegation in targets {
            let shared = self.clone();
            let sk = sk.clone();
            let results = results.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SlashingError::Cancelled),
                    result = shared.slash_with_permit(&sk, &delegation) => result,
                };

                let _ = results.send(SlashResult {
                    staking_tx_hash: delegation.staking_tx_hash(),
                    fp_btc_pk: fp_pk,
                    total_sat: delegation.total_sat,
                    result,
                });
            });
        }

        self.metrics.slashed_finality_providers.inc();
    }

    async fn has_unbonding_quorum(&self, delegation: &BtcDelegation) -> bool {
        let Some(undelegation) = &delegation.undelegation else {
            return false;
        };

        match self.params.get(delegation.params_version).await {
            Ok(params) => {
                undelegation.covenant_slashing_sigs.len() >= params.covenant_quorum as usize
            }
            Err(e) => {
                warn!(staking_tx_hash = %delegation.staking_tx_hash(), %e, "no staking parameters for delegation");
                false
            }
        }
    }

    async fn slash_with_permit(
        &self,
        sk: &SecretKeyHolder,
        delegation: &BtcDelegation,
    ) -> Result<(), SlashingError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| SlashingError::Cancelled)?;

        self.slash_btc_delegation(sk, delegation).await
    }

    /// Slashes the staking output and, if the delegation unbonded on Bitcoin, the unbonding
    /// output. Succeeds if either slashing tx is on Bitcoin afterwards.
    async fn slash_btc_delegation(
        &self,
        sk: &SecretKeyHolder,
        delegation: &BtcDelegation,
    ) -> Result<(), SlashingError> {
        let params = self.params.get(delegation.params_version).await?;
        let staking_tx_hash = delegation.staking_tx_hash();

        let staking = self
            .send_slashing_tx(sk, delegation, &params, SlashingTxKind::StakingSlashing)
            .await;
        if let Err(e) = &staking {
            debug!(%staking_tx_hash, %e, "staking output not slashed");
        }

        let Some(undelegation) = &delegation.undelegation else {
            return staking;
        };

        if !self
            .is_tx_submitted_to_bitcoin(&undelegation.unbonding_tx.compute_txid())
            .await?
        {
            return staking;
        }

        let unbonding = self
            .send_slashing_tx(sk, delegation, &params, SlashingTxKind::UnbondingSlashing)
            .await;

        match (staking, unbonding) {
            (Ok(()), _) | (_, Ok(())) => Ok(()),
            (Err(_), Err(e)) => Err(e),
        }
    }

    async fn send_slashing_tx(
        &self,
        sk: &SecretKeyHolder,
        delegation: &BtcDelegation,
        params: &StakingParams,
        kind: SlashingTxKind,
    ) -> Result<(), SlashingError> {
        let staking_tx_hash = delegation.staking_tx_hash();
        let (slashing_txid, funding_outpoint) = match kind {
            SlashingTxKind::StakingSlashing => (
                delegation.slashing_tx.compute_txid(),
                OutPoint::new(staking_tx_hash, delegation.staking_output_idx),
            ),
            SlashingTxKind::UnbondingSlashing => {
                let undelegation = delegation
                    .undelegation
                    .as_ref()
                    .ok_or(SlashingError::NotUnbonded(staking_tx_hash))?;
                (
                    undelegation.slashing_tx.compute_txid(),
                    OutPoint::new(undelegation.unbonding_tx.compute_txid(), 0),
                )
            }
        };

        if self.is_tx_submitted_to_bitcoin(&slashing_txid).await? {
            info!(%staking_tx_hash, %slashing_txid, ?kind, "slashing tx already on bitcoin");
            return Ok(());
        }

        if !self.is_taproot_output_spendable(&funding_outpoint).await? {
            return Err(SlashingError::OutputNotSpendable(funding_outpoint));
        }

        let tx = sk.with_secret(|sk| build_slashing_tx_with_witness(sk, delegation, params, kind))?;
        let txid = self.btc.send_raw_transaction(&tx).await?;
        info!(%staking_tx_hash, %txid, ?kind, "broadcast slashing tx");

        Ok(())
    }

    fn record_result(&self, res: SlashResult, sink: Option<&mpsc::UnboundedSender<SlashResult>>) {
        let SlashResult {
            staking_tx_hash,
            fp_btc_pk,
            total_sat,
            result,
        } = &res;

        match result {
            Ok(()) => {
                info!(%staking_tx_hash, fp_pk = %fp_btc_pk, %total_sat, "slashed delegation");
                self.metrics.slashed_delegations.inc();
                self.metrics.slashed_sats.inc_by(total_sat.to_sat());
            }
            Err(e) => {
                error!(%staking_tx_hash, fp_pk = %fp_btc_pk, %e, "failed to slash delegation")
            }
        }

        if let Some(sink) = sink {
            let _ = sink.send(res);
        }
    }
}

async fn equivocation_tracker(
    shared: Arc<Shared>,
    same_chain: Subscription<ChainEvent>,
    consumer: Subscription<ChainEvent>,
    key_tx: mpsc::Sender<SecretKey>,
    cancel: CancellationToken,
) {
    let mut events = stream::select(
        same_chain.map(|event| (event, false)),
        consumer.map(|event| (event, true)),
    );

    loop {
        let (event, is_consumer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => {
                    warn!("evidence subscriptions closed");
                    break;
                }
            },
        };

        let Some(sk) = shared.handle_evidence(&event, is_consumer) else {
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = key_tx.send(sk) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }

    debug!("equivocation tracker exited");
}

async fn slashing_enforcer(
    shared: Arc<Shared>,
    mut key_rx: mpsc::Receiver<SecretKey>,
    result_sink: Option<mpsc::UnboundedSender<SlashResult>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
) {
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(sk) = key_rx.recv() => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = shared.slash_finality_provider(sk, &tasks, &result_tx, &cancel) => {}
                }
            }
            Some(res) = result_rx.recv() => shared.record_result(res, result_sink.as_ref()),
            else => break,
        }
    }

    debug!("slashing enforcer exited");
}
