//! RPC provider pool and chain access
//!
//! All network access to a chain goes through a [`ProviderPool`], which holds
//! the configured endpoints per chain id and picks one uniformly at random
//! per call. The pool holds no per-call state and is safe for concurrent use.
//!
//! The [`ChainClient`] trait is the seam between the pipeline and the RPC
//! layer; production uses the ethers-backed implementation, tests substitute
//! fakes.

use crate::config::ChainsConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A handle to one chain's RPC surface.
pub type ProviderHandle = Arc<dyn ChainClient>;

/// The RPC operations the pipeline consumes.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head block number.
    async fn get_block_number(&self) -> Result<u64>;

    /// Timestamp (epoch seconds) of the given block, if it exists.
    async fn get_block_timestamp(&self, number: u64) -> Result<Option<u64>>;

    /// All logs matching the filter.
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>>;

    /// The transaction with the given hash, if known.
    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>>;

    /// The receipt for the given transaction, if mined.
    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>>;

    /// `eth_call` against a contract.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;
}

/// Pools of RPC endpoints per chain id. One endpoint is picked at random per
/// `get` call to spread load; there is no ordering guarantee.
pub struct ProviderPool {
    pools: BTreeMap<String, Vec<ProviderHandle>>,
}

impl ProviderPool {
    /// Build the pool from configuration. Endpoints that fail URL parsing are
    /// rejected up front.
    pub fn from_config(chains: &ChainsConfig) -> Result<Self> {
        let mut pools: BTreeMap<String, Vec<ProviderHandle>> = BTreeMap::new();
        for (chain_id, urls) in &chains.providers {
            let mut handles: Vec<ProviderHandle> = Vec::with_capacity(urls.len());
            for url in urls {
                let provider = Provider::<Http>::try_from(url.as_str()).map_err(|e| {
                    Error::config(format!("Invalid RPC URL for chain {}: {}", chain_id, e))
                })?;
                handles.push(Arc::new(EthersChainClient::new(provider)));
            }
            pools.insert(chain_id.clone(), handles);
        }
        Ok(Self { pools })
    }

    /// Build a pool from pre-constructed handles (tests).
    pub fn from_handles(pools: BTreeMap<String, Vec<ProviderHandle>>) -> Self {
        Self { pools }
    }

    /// Pick a random provider for the chain.
    pub fn get(&self, chain_id: &str) -> Result<ProviderHandle> {
        let handles = self
            .pools
            .get(chain_id)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::UnsupportedChain {
                chain_id: chain_id.to_string(),
            })?;
        let handle = handles
            .choose(&mut rand::thread_rng())
            .expect("non-empty pool");
        Ok(handle.clone())
    }

    pub fn supports(&self, chain_id: &str) -> bool {
        self.pools.get(chain_id).is_some_and(|h| !h.is_empty())
    }
}

/// ethers-backed [`ChainClient`].
pub struct EthersChainClient {
    provider: Provider<Http>,
}

impl EthersChainClient {
    pub fn new(provider: Provider<Http>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn get_block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(classify_rpc_error)
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<Option<u64>> {
        let block = self
            .provider
            .get_block(number)
            .await
            .map_err(classify_rpc_error)?;
        Ok(block.map(|b| b.timestamp.as_u64()))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(classify_rpc_error)
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        self.provider
            .get_transaction(hash)
            .await
            .map_err(classify_rpc_error)
    }

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(classify_rpc_error)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider
            .call(&tx, None)
            .await
            .map_err(classify_rpc_error)
    }
}

/// Map a raw provider error into the crate taxonomy: rate limits, timeouts
/// and server errors are retryable; malformed requests are fatal; block-range
/// complaints get their own variant so the paginator can narrow its window.
pub fn classify_rpc_error(err: ProviderError) -> Error {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("block range") || lower.contains("range too large") || lower.contains("query returned more than")
    {
        return Error::RangeTooLarge { message };
    }
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return Error::RateLimited {
            retry_after_ms: 1000,
        };
    }
    if lower.contains("invalid params")
        || lower.contains("method not found")
        || lower.contains("unsupported method")
        || lower.contains("invalid argument")
    {
        return Error::InvalidRpcRequest {
            message: message.into(),
        };
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return Error::Timeout { timeout_ms: 0 };
    }
    Error::Blockchain {
        message: message.into(),
        source: Some(Box::new(err)),
    }
}

/// `true` for "execution reverted" class failures of an `eth_call`.
pub fn is_call_revert(err: &Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("revert") || text.contains("execution error") || text.contains("bad instruction")
}

/// Retry helper for RPC calls with exponential backoff
pub async fn with_retry<T, F, Fut>(
    operation: F,
    max_retries: u32,
    initial_delay: Duration,
    operation_name: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                warn!(
                    "{} failed (attempt {}/{}): {:?}",
                    operation_name,
                    attempt + 1,
                    max_retries,
                    e
                );

                last_error = Some(e);

                if attempt + 1 < max_retries {
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::blockchain("Max retries exceeded")))
}

/// Parse an Ethereum address from string
pub fn parse_address(addr: &str) -> Result<Address> {
    addr.parse().map_err(|_| Error::InvalidAddress {
        address: addr.to_string(),
    })
}
