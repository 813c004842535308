//! Versioned staking parameters, fetched lazily and cached.

use std::{collections::BTreeMap, sync::Arc};

use btcstaking_primitives::types::StakingParams;
use parking_lot::RwLock;
use tracing::debug;

use crate::{clients::ChainAdapter, errors::ClientError};

/// Cache of every staking parameters version seen so far.
///
/// Parameter versions never change once activated, so entries are never invalidated.
#[derive(Debug)]
pub(crate) struct ParamsCache {
    chain: Arc<dyn ChainAdapter>,
    versions: RwLock<BTreeMap<u32, StakingParams>>,
}

impl ParamsCache {
    pub(crate) fn new(chain: Arc<dyn ChainAdapter>) -> Self {
        Self {
            chain,
            versions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Fetches all known versions unless some are cached already.
    pub(crate) async fn load_all(&self) -> Result<(), ClientError> {
        if !self.versions.read().is_empty() {
            return Ok(());
        }

        let all = self.chain.all_btc_staking_params().await?;
        debug!(versions = all.len(), "loaded staking parameters");

        let mut versions = self.versions.write();
        for params in all {
            versions.insert(params.version, params);
        }

        Ok(())
    }

    /// The parameters of `version`, fetched from the chain on a miss.
    pub(crate) async fn get(&self, version: u32) -> Result<StakingParams, ClientError> {
        if let Some(params) = self.versions.read().get(&version) {
            return Ok(params.clone());
        }

        let params = self.chain.btc_staking_params(version).await?;
        self.versions.write().insert(version, params.clone());

        Ok(params)
    }
}
