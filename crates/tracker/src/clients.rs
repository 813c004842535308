//! The collaborators the slashers talk to.
//!
//! Both slashers only see the staking chain through [`ChainAdapter`] and Bitcoin through
//! [`BitcoinClient`]. Production deployments plug in RPC-backed implementations, tests plug in
//! in-memory fakes. Implementations must be safe to call from many tasks at once.

use std::fmt::Debug;

use async_trait::async_trait;
use bitcoin::{Block, OutPoint, Transaction, TxOut, Txid};
use btcstaking_primitives::types::{
    BtcDelegation, BtcDelegationStatus, CheckpointParams, Evidence, StakingParams,
};
use secp256k1::{SecretKey, XOnlyPublicKey};

use crate::{errors::ClientError, subscription::Subscription};

/// An event of the staking chain matched by a subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    /// Height of the staking chain block the event was emitted in.
    pub height: u64,

    /// Equivocation evidence carried by the event, if any.
    pub evidence: Option<Evidence>,
}

/// Access to the staking chain.
#[async_trait]
pub trait ChainAdapter: Debug + Send + Sync {
    /// Fetches the checkpointing parameters.
    async fn btc_checkpoint_params(&self) -> Result<CheckpointParams, ClientError>;

    /// Fetches every version of the staking parameters.
    async fn all_btc_staking_params(&self) -> Result<Vec<StakingParams>, ClientError>;

    /// Fetches one version of the staking parameters.
    async fn btc_staking_params(&self, version: u32) -> Result<StakingParams, ClientError>;

    /// Fetches all delegations with the given status.
    async fn btc_delegations(
        &self,
        status: BtcDelegationStatus,
    ) -> Result<Vec<BtcDelegation>, ClientError>;

    /// Fetches one delegation by its staking transaction hash.
    async fn btc_delegation(
        &self,
        staking_tx_hash: &Txid,
    ) -> Result<Option<BtcDelegation>, ClientError>;

    /// Fetches the active and the unbonded delegations restaked to a finality provider.
    async fn active_and_unbonded_delegations(
        &self,
        fp_pk: &XOnlyPublicKey,
    ) -> Result<(Vec<BtcDelegation>, Vec<BtcDelegation>), ClientError>;

    /// Subscribes `subscriber` to the events matching `query`.
    async fn subscribe(
        &self,
        subscriber: &str,
        query: &str,
    ) -> Result<Subscription<ChainEvent>, ClientError>;

    /// Drops all subscriptions of `subscriber`.
    async fn unsubscribe_all(&self, subscriber: &str) -> Result<(), ClientError>;

    /// Reports a selective slashing by submitting the recovered key of the finality provider.
    async fn report_selective_slashing(
        &self,
        staking_tx_hash: &Txid,
        recovered_sk: &SecretKey,
    ) -> Result<(), ClientError>;

    /// Whether the finality provider has already been slashed on the staking chain.
    async fn is_finality_provider_slashed(&self, fp_pk: &XOnlyPublicKey)
        -> Result<bool, ClientError>;

    /// Lists the equivocation evidence recorded from `start_height` on.
    async fn list_evidences(&self, start_height: u64) -> Result<Vec<Evidence>, ClientError>;
}

/// Access to a Bitcoin node.
#[async_trait]
pub trait BitcoinClient: Debug + Send + Sync {
    /// Fetches a transaction known to the node, `None` if it is neither mined nor in the mempool.
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ClientError>;

    /// Fetches an unspent output, `None` if it is spent or never existed.
    async fn get_tx_out(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, ClientError>;

    /// Broadcasts a signed transaction.
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, ClientError>;

    /// Streams every block connected to the best chain.
    async fn subscribe_blocks(&self) -> Result<Subscription<Block>, ClientError>;
}
