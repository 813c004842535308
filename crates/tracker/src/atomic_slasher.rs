//! Detection of selective slashing on Bitcoin.
//!
//! A selective slashing happens when a finality provider colludes with the covenant committee to
//! slash one delegation without equivocating on the staking chain. The slashing tx it publishes
//! necessarily reveals the provider's key: every covenant signature in the witness is the
//! decryption of an adaptor signature encrypted under that key. The [`AtomicSlasher`] watches
//! Bitcoin for such transactions, recovers the key and reports the incident so the provider is
//! slashed on the staking chain too. Optionally the key is also forwarded to the equivocation
//! enforcer, which then slashes every other delegation of the provider.

use std::{collections::BTreeSet, sync::Arc};

use bitcoin::{Block, Transaction};
use btcstaking_primitives::types::{BtcDelegation, BtcDelegationStatus, SelectiveSlashingEvidence};
use futures::StreamExt;
use secp256k1::SecretKey;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::{BitcoinClient, ChainAdapter},
    config::TrackerConfig,
    errors::TrackerError,
    index::{DelegationIndex, TrackedDelegation, TrackedStatus},
    lifecycle::{Lifecycle, LifecycleState},
    metrics::SlasherMetrics,
    params::ParamsCache,
    retry::{retry, RetryPolicy},
    subscription::Subscription,
    witness::try_extract_fp_sk,
};

#[derive(Debug)]
struct Shared {
    config: TrackerConfig,
    chain: Arc<dyn ChainAdapter>,
    index: DelegationIndex,
    params: ParamsCache,
    metrics: SlasherMetrics,
}

/// Watches Bitcoin for slashing transactions the staking chain never authorized.
#[derive(Debug)]
pub struct AtomicSlasher {
    shared: Arc<Shared>,
    btc: Arc<dyn BitcoinClient>,
    slashing_sink: Option<mpsc::Sender<SecretKey>>,
    lifecycle: Lifecycle,
}

impl AtomicSlasher {
    /// Creates a slasher that is not started yet.
    pub fn new(
        config: TrackerConfig,
        chain: Arc<dyn ChainAdapter>,
        btc: Arc<dyn BitcoinClient>,
        metrics: SlasherMetrics,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                params: ParamsCache::new(chain.clone()),
                chain,
                index: DelegationIndex::new(),
                metrics,
            }),
            btc,
            slashing_sink: None,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Forwards every reported key to `sink`, usually
    /// [`EquivocationSlasher::key_sender`](crate::equivocation_slasher::EquivocationSlasher::key_sender).
    pub fn with_slashing_sink(mut self, sink: mpsc::Sender<SecretKey>) -> Self {
        self.slashing_sink = Some(sink);
        self
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// The delegations under observation.
    pub fn index(&self) -> &DelegationIndex {
        &self.shared.index
    }

    /// Loads the staking parameters, subscribes to new blocks and launches the workers.
    ///
    /// Returns as soon as the workers run. Starting twice, or after [`Self::stop`], does nothing.
    pub async fn start(&self) -> Result<(), TrackerError> {
        self.shared.config.validate()?;

        if !self.lifecycle.begin_start() {
            debug!(state = ?self.state(), "atomic slasher already started");
            return Ok(());
        }

        if let Err(e) = self.shared.params.load_all().await {
            self.lifecycle.abort_start();
            return Err(TrackerError::Params(e));
        }

        let blocks = match self.btc.subscribe_blocks().await {
            Ok(blocks) => blocks,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(TrackerError::Subscribe(e));
            }
        };

        let (evidence_tx, evidence_rx) = mpsc::channel(self.shared.config.new_delegations_buffer);
        let sink = self.slashing_sink.clone();

        let spawned = self.lifecycle.commit_start(|tasks, cancel| {
            tasks.spawn(btc_delegation_tracker(self.shared.clone(), cancel.clone()));
            tasks.spawn(slashing_tx_tracker(
                self.shared.clone(),
                blocks,
                evidence_tx,
                cancel.clone(),
            ));
            tasks.spawn(selective_slashing_reporter(
                self.shared.clone(),
                evidence_rx,
                sink,
                cancel.clone(),
            ));
        });

        match spawned {
            true => info!("atomic slasher started"),
            false => debug!("atomic slasher stopped while starting"),
        }

        Ok(())
    }

    /// Signals every worker to quit and waits for them to exit. Idempotent.
    pub async fn stop(&self) {
        if let Some(prev) = self.lifecycle.begin_stop() {
            info!(?prev, "stopping atomic slasher");
        }

        self.lifecycle.shutdown().await;
        debug!("atomic slasher workers exited");
    }
}

impl Shared {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    async fn track(&self, delegation: BtcDelegation) {
        let staking_tx_hash = delegation.staking_tx_hash();
        if let Some(existing) = self.index.get(&staking_tx_hash) {
            if existing.status == TrackedStatus::Slashed
                || existing.delegation.status == delegation.status
            {
                return;
            }
        }

        let params = match self.params.get(delegation.params_version).await {
            Ok(params) => params,
            Err(e) => {
                warn!(%staking_tx_hash, version = %delegation.params_version, %e, "no staking parameters for delegation");
                return;
            }
        };

        debug!(%staking_tx_hash, status = ?delegation.status, "tracking delegation");
        self.index.add(TrackedDelegation::new(delegation, &params));
    }

    /// Brings the index in line with the delegations the staking chain reports.
    async fn sync_delegations(&self, cancel: &CancellationToken) {
        let mut seen = BTreeSet::new();

        for status in [BtcDelegationStatus::Active, BtcDelegationStatus::Unbonded] {
            let delegations = match retry(self.retry_policy(), cancel, "btc_delegations", || {
                self.chain.btc_delegations(status)
            })
            .await
            {
                Ok(delegations) => delegations,
                Err(e) => {
                    warn!(?status, %e, "failed to fetch delegations, keeping the current index");
                    return;
                }
            };

            for delegation in delegations {
                seen.insert(delegation.staking_tx_hash());
                self.track(delegation).await;
            }
        }

        for staking_tx_hash in self.index.staking_tx_hashes() {
            if seen.contains(&staking_tx_hash) {
                continue;
            }

            match self.chain.btc_delegation(&staking_tx_hash).await {
                Ok(Some(delegation))
                    if matches!(
                        delegation.status,
                        BtcDelegationStatus::Active | BtcDelegationStatus::Unbonded
                    ) =>
                {
                    self.track(delegation).await
                }
                Ok(Some(delegation)) => {
                    debug!(%staking_tx_hash, status = ?delegation.status, "delegation ended, untracking");
                    self.index.remove(&staking_tx_hash);
                }
                Ok(None) => {
                    debug!(%staking_tx_hash, "delegation no longer exists, untracking");
                    self.index.remove(&staking_tx_hash);
                }
                Err(e) => warn!(%staking_tx_hash, %e, "failed to refresh delegation"),
            }
        }

        debug!(tracked = %self.index.len(), "synced delegations");
    }

    /// Checks whether `tx` slashes a tracked delegation and, if so, recovers the finality
    /// provider's key from it.
    fn inspect_tx(&self, tx: &Transaction) -> Option<SelectiveSlashingEvidence> {
        let txid = tx.compute_txid();
        let (tracked, kind) = self.index.find_slashed_btc_delegation(&txid)?;
        let staking_tx_hash = tracked.staking_tx_hash();
        let candidate = tracked.slashing_tx_info(kind, tx.clone())?;

        let parsed = match candidate.classify() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%txid, %staking_tx_hash, ?kind, %e, "ignoring malformed slashing tx");
                return None;
            }
        };

        let fp_pk = parsed.fp_pk;
        info!(%txid, %staking_tx_hash, ?kind, %fp_pk, "slashing tx of tracked delegation found on bitcoin");
        self.index.set_status(&staking_tx_hash, TrackedStatus::Slashed);

        let fp_idx = tracked.delegation.fp_index(&fp_pk)?;
        let cov_asigs = tracked.covenant_sigs(kind)?;
        let quorum = tracked.slashing_path.covenant_quorum as usize;

        let Some(sk) = try_extract_fp_sk(&parsed.covenant_sigs, fp_idx, &fp_pk, cov_asigs, quorum)
        else {
            warn!(%txid, %staking_tx_hash, %fp_pk, "slashing tx does not reveal the finality provider key");
            return None;
        };

        info!(%staking_tx_hash, %fp_pk, "recovered key of selectively slashing finality provider");
        self.metrics.detected_selective_slashing.inc();

        Some(SelectiveSlashingEvidence {
            staking_tx_hash,
            fp_btc_pk: fp_pk,
            recovered_fp_btc_sk: sk.into_inner(),
        })
    }

    /// Reports `evidence` once. Returns whether the chain accepted the report.
    async fn report(&self, evidence: &SelectiveSlashingEvidence) -> bool {
        let SelectiveSlashingEvidence {
            staking_tx_hash,
            fp_btc_pk,
            recovered_fp_btc_sk,
        } = evidence;

        match self.chain.is_finality_provider_slashed(fp_btc_pk).await {
            Ok(true) => {
                info!(%staking_tx_hash, %fp_btc_pk, "finality provider already slashed, skipping report");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%staking_tx_hash, %fp_btc_pk, %e, "failed to query finality provider, reporting anyway")
            }
        }

        match self
            .chain
            .report_selective_slashing(staking_tx_hash, recovered_fp_btc_sk)
            .await
        {
            Ok(()) => {
                info!(%staking_tx_hash, %fp_btc_pk, "reported selective slashing");
                self.metrics.reported_selective_slashing.inc();
                true
            }
            Err(e) => {
                error!(%staking_tx_hash, %fp_btc_pk, %e, "failed to report selective slashing");
                false
            }
        }
    }
}

async fn btc_delegation_tracker(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.check_delegations_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = shared.sync_delegations(&cancel) => {}
                }
            }
        }
    }

    debug!("delegation tracker exited");
}

async fn slashing_tx_tracker(
    shared: Arc<Shared>,
    mut blocks: Subscription<Block>,
    evidence_tx: mpsc::Sender<SelectiveSlashingEvidence>,
    cancel: CancellationToken,
) {
    'blocks: loop {
        let block = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block = blocks.next() => match block {
                Some(block) => block,
                None => {
                    warn!("block subscription closed");
                    break;
                }
            },
        };

        let block_hash = block.block_hash();
        let found: Vec<_> = block
            .txdata
            .iter()
            .filter_map(|tx| shared.inspect_tx(tx))
            .collect();
        debug!(%block_hash, txs = %block.txdata.len(), selective = %found.len(), "inspected block");

        for evidence in found {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'blocks,
                res = evidence_tx.send(evidence) => {
                    if res.is_err() {
                        break 'blocks;
                    }
                }
            }
        }
    }

    debug!("slashing tx tracker exited");
}

async fn selective_slashing_reporter(
    shared: Arc<Shared>,
    mut evidence_rx: mpsc::Receiver<SelectiveSlashingEvidence>,
    sink: Option<mpsc::Sender<SecretKey>>,
    cancel: CancellationToken,
) {
    loop {
        let evidence = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            evidence = evidence_rx.recv() => match evidence {
                Some(evidence) => evidence,
                None => break,
            },
        };

        let reported = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reported = shared.report(&evidence) => reported,
        };

        let Some(sink) = sink.as_ref().filter(|_| reported) else {
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = sink.send(evidence.recovered_fp_btc_sk) => {
                if res.is_err() {
                    warn!(fp_pk = %evidence.fp_btc_pk, "slashing sink closed, key not forwarded");
                }
            }
        }
    }

    debug!("selective slashing reporter exited");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bitcoin::Witness;
    use btcstaking_common::logging::{self, LoggerConfig};
    use btcstaking_primitives::types::SlashingTxKind;
    use btcstaking_test_utils::{
        bitcoin::{generate_block_with_txs, generate_secret_keys},
        staking::{CovenantCommittee, DelegationFixture},
    };
    use prometheus::Registry;
    use secp256k1::SECP256K1;

    use super::*;
    use crate::{
        errors::ClientError,
        testing::{wait_until, FakeBitcoin, FakeChain},
    };

    fn test_config() -> TrackerConfig {
        TrackerConfig::default()
            .with_check_delegations_interval(Duration::from_millis(10))
            .with_retries(1, Duration::from_millis(1))
    }

    fn setup(committee: &CovenantCommittee) -> (Arc<FakeChain>, Arc<FakeBitcoin>, AtomicSlasher) {
        let chain = Arc::new(FakeChain::new(committee.params.clone()));
        let btc = Arc::new(FakeBitcoin::default());
        let metrics = SlasherMetrics::new(&Registry::new()).unwrap();
        let slasher = AtomicSlasher::new(test_config(), chain.clone(), btc.clone(), metrics);

        (chain, btc, slasher)
    }

    #[tokio::test]
    async fn selective_slashing_is_reported_and_forwarded() {
        logging::init(LoggerConfig::new(
            "selective_slashing_is_reported_and_forwarded".to_string(),
        ));
        let committee = CovenantCommittee::new(3, 2);
        let fixture = DelegationFixture::new(&committee, generate_secret_keys(2), false);
        let (chain, btc, slasher) = setup(&committee);
        chain.add_delegation(fixture.delegation.clone());

        let (sink_tx, mut sink_rx) = mpsc::channel(1);
        let slasher = slasher.with_slashing_sink(sink_tx);
        slasher.start().await.unwrap();
        assert_eq!(slasher.state(), LifecycleState::Running);
        wait_until(|| slasher.index().len() == 1).await;

        let slashing_tx = fixture.selectively_slashed_tx(1, SlashingTxKind::StakingSlashing);
        btc.mine(generate_block_with_txs(100, vec![slashing_tx]));

        let forwarded = tokio::time::timeout(Duration::from_secs(5), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let expected_pk = fixture.fp_sks[1].x_only_public_key(SECP256K1).0;
        assert_eq!(forwarded.x_only_public_key(SECP256K1).0, expected_pk);

        let staking_tx_hash = fixture.delegation.staking_tx_hash();
        assert_eq!(chain.reports.lock().len(), 1);
        assert_eq!(chain.reports.lock()[0].0, staking_tx_hash);
        assert_eq!(
            slasher.index().get(&staking_tx_hash).unwrap().status,
            TrackedStatus::Slashed
        );
        assert_eq!(slasher.shared.metrics.detected_selective_slashing.get(), 1);
        assert_eq!(slasher.shared.metrics.reported_selective_slashing.get(), 1);

        slasher.stop().await;
        assert_eq!(slasher.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn malformed_covenant_signature_is_not_reported() {
        logging::init(LoggerConfig::new(
            "malformed_covenant_signature_is_not_reported".to_string(),
        ));
        let committee = CovenantCommittee::new(3, 2);
        let victim = DelegationFixture::new(&committee, generate_secret_keys(1), false);
        let other = DelegationFixture::new(&committee, generate_secret_keys(1), false);
        let (chain, btc, slasher) = setup(&committee);
        chain.add_delegation(victim.delegation.clone());
        chain.add_delegation(other.delegation.clone());

        slasher.start().await.unwrap();
        wait_until(|| slasher.index().len() == 2).await;

        let mut malformed = victim.selectively_slashed_tx(0, SlashingTxKind::StakingSlashing);
        let mut elems: Vec<Vec<u8>> = malformed.input[0].witness.to_vec();
        let cov_slot = elems
            .iter()
            .position(|elem| !elem.is_empty())
            .unwrap();
        elems[cov_slot].truncate(63);
        malformed.input[0].witness = Witness::from_slice(&elems);

        btc.mine(generate_block_with_txs(100, vec![malformed]));

        // blocks are inspected in order, so once the second one is reported the first is done
        let valid = other.selectively_slashed_tx(0, SlashingTxKind::StakingSlashing);
        btc.mine(generate_block_with_txs(101, vec![valid]));
        wait_until(|| chain.reports.lock().len() == 1).await;

        assert_eq!(
            chain.reports.lock()[0].0,
            other.delegation.staking_tx_hash()
        );
        assert_eq!(
            slasher
                .index()
                .get(&victim.delegation.staking_tx_hash())
                .unwrap()
                .status,
            TrackedStatus::Active
        );
        assert_eq!(slasher.shared.metrics.detected_selective_slashing.get(), 1);

        slasher.stop().await;
    }

    #[tokio::test]
    async fn already_slashed_provider_is_not_reported() {
        let committee = CovenantCommittee::new(3, 2);
        let fixture = DelegationFixture::new(&committee, generate_secret_keys(1), true);
        let (chain, btc, slasher) = setup(&committee);
        chain.add_delegation(fixture.delegation.clone());
        chain
            .slashed_fps
            .lock()
            .insert(fixture.fp_sks[0].x_only_public_key(SECP256K1).0);

        slasher.start().await.unwrap();
        wait_until(|| slasher.index().len() == 1).await;

        let slashing_tx = fixture.selectively_slashed_tx(0, SlashingTxKind::UnbondingSlashing);
        btc.mine(generate_block_with_txs(100, vec![slashing_tx]));
        wait_until(|| slasher.shared.metrics.detected_selective_slashing.get() == 1).await;

        slasher.stop().await;
        assert!(chain.reports.lock().is_empty());
        assert_eq!(slasher.shared.metrics.reported_selective_slashing.get(), 0);
    }

    #[tokio::test]
    async fn sync_follows_chain_status() {
        let committee = CovenantCommittee::new(3, 2);
        let staying = DelegationFixture::new(&committee, generate_secret_keys(1), false);
        let expiring = DelegationFixture::new(&committee, generate_secret_keys(1), false);
        let (chain, _btc, slasher) = setup(&committee);
        chain.add_delegation(staying.delegation.clone());
        chain.add_delegation(expiring.delegation.clone());

        slasher.start().await.unwrap();
        wait_until(|| slasher.index().len() == 2).await;

        let expiring_hash = expiring.delegation.staking_tx_hash();
        chain
            .delegations
            .lock()
            .get_mut(&expiring_hash)
            .unwrap()
            .status = BtcDelegationStatus::Expired;
        wait_until(|| slasher.index().len() == 1).await;

        assert!(slasher.index().get(&expiring_hash).is_none());
        assert!(slasher
            .index()
            .get(&staying.delegation.staking_tx_hash())
            .is_some());

        slasher.stop().await;
    }

    #[tokio::test]
    async fn failed_start_leaves_slasher_stoppable() {
        let committee = CovenantCommittee::new(3, 2);
        let (chain, _btc, slasher) = setup(&committee);
        chain
            .fail_params
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(matches!(
            slasher.start().await,
            Err(TrackerError::Params(ClientError::Request(_)))
        ));
        assert_eq!(slasher.state(), LifecycleState::NotStarted);

        slasher.stop().await;
        assert_eq!(slasher.state(), LifecycleState::Stopped);

        // a stopped slasher never starts again
        slasher.start().await.unwrap();
        assert_eq!(slasher.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let committee = CovenantCommittee::new(3, 2);
        let (_chain, _btc, slasher) = setup(&committee);
        slasher.start().await.unwrap();

        tokio::join!(slasher.stop(), slasher.stop());
        slasher.stop().await;
        assert_eq!(slasher.state(), LifecycleState::Stopped);
    }
}
