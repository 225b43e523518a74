//! Mint collection
//!
//! Consumes paginated transfer-event chunks and produces normalized mint
//! records. Each event needs two pieces of non-free auxiliary data — the
//! containing block's timestamp and the price paid per mint — both resolved
//! through a shared bounded gate with per-run memoization, and both degrading
//! to zero after bounded retries rather than blocking the pipeline.
//!
//! Chunks are processed on their own bounded task pool so one slow block
//! range does not starve later ones; a watchdog logs when nothing has
//! dequeued for a while.

use crate::contract::{erc721::TRANSFER_TOPIC, ContractAdapter};
use crate::error::Result;
use crate::model::Token;
use crate::paginator::LogChunk;
use crate::provider::{with_retry, ProviderHandle};
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of one mint-collection pass. `got_all_blocks == false` tells the
/// caller to resume pagination from `last_successful_block` on the next
/// attempt instead of restarting from the creation block.
#[derive(Debug, Clone)]
pub struct MintBatch {
    pub tokens: Vec<Token>,
    pub failed_with_unknown_errors: u64,
    pub got_all_blocks: bool,
    pub start_block: u64,
    pub last_successful_block: u64,
}

/// Progress sink invoked once per consumed chunk.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Clone)]
pub struct MintCollector {
    client: ProviderHandle,
    adapter: Arc<dyn ContractAdapter>,
    /// Gate on simultaneous provider calls for block/price lookups; distinct
    /// from the block-range fetch concurrency.
    gate: Arc<Semaphore>,
    chunk_concurrency: usize,
    lookup_attempts: u32,
    /// Per-run caches; scoped to one collection run, never shared across
    /// collections or processes.
    block_timestamps: Arc<Mutex<HashMap<u64, u64>>>,
    tx_prices: Arc<Mutex<HashMap<H256, f64>>>,
}

impl MintCollector {
    pub fn new(
        client: ProviderHandle,
        adapter: Arc<dyn ContractAdapter>,
        gate_size: usize,
        chunk_concurrency: usize,
        lookup_attempts: u32,
    ) -> Self {
        Self {
            client,
            adapter,
            gate: Arc::new(Semaphore::new(gate_size)),
            chunk_concurrency,
            lookup_attempts,
            block_timestamps: Arc::new(Mutex::new(HashMap::new())),
            tx_prices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drain the chunk stream into normalized mint records.
    pub async fn collect(
        &self,
        mut chunks: mpsc::Receiver<Result<LogChunk>>,
        start_block: u64,
        progress: ProgressSink,
    ) -> MintBatch {
        let chunk_sem = Arc::new(Semaphore::new(self.chunk_concurrency));
        let mut join: JoinSet<(u64, u64, Vec<Token>, u64)> = JoinSet::new();
        let mut got_all_blocks = true;

        loop {
            tokio::select! {
                chunk = chunks.recv() => {
                    match chunk {
                        None => break,
                        Some(Err(e)) => {
                            warn!("mint pagination failed mid-stream: {}", e);
                            got_all_blocks = false;
                            break;
                        }
                        Some(Ok(chunk)) => {
                            progress(chunk.progress);
                            let permit = chunk_sem
                                .clone()
                                .acquire_owned()
                                .await
                                .expect("chunk semaphore closed");
                            let collector = self.clone();
                            join.spawn(async move {
                                let _permit = permit;
                                collector.process_chunk(chunk).await
                            });
                        }
                    }
                }
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                    info!(
                        "mint queue stalled: no chunk dequeued for {:?}",
                        WATCHDOG_INTERVAL
                    );
                }
            }
        }

        let mut completed: Vec<(u64, u64)> = Vec::new();
        let mut tokens = Vec::new();
        let mut failed_with_unknown_errors = 0u64;

        while let Some(result) = join.join_next().await {
            match result {
                Ok((from, to, mut chunk_tokens, failed)) => {
                    completed.push((from, to));
                    tokens.append(&mut chunk_tokens);
                    failed_with_unknown_errors += failed;
                }
                Err(e) => {
                    warn!("chunk task failed: {}", e);
                    got_all_blocks = false;
                }
            }
        }

        // The resume cursor only advances across contiguously completed
        // ranges; anything past a gap must be re-fetched next attempt.
        completed.sort_unstable();
        let mut next_expected = start_block;
        for (from, to) in completed {
            if from > next_expected {
                got_all_blocks = false;
                break;
            }
            next_expected = next_expected.max(to + 1);
        }
        let last_successful_block = next_expected.max(start_block + 1) - 1;

        MintBatch {
            tokens,
            failed_with_unknown_errors,
            got_all_blocks,
            start_block,
            last_successful_block,
        }
    }

    /// Decode every mint in a chunk and resolve its auxiliary data.
    async fn process_chunk(&self, chunk: LogChunk) -> (u64, u64, Vec<Token>, u64) {
        let mut tokens = Vec::new();
        let mut failed = 0u64;

        for log in &chunk.events {
            let transfer = match self.adapter.decode_transfer(log) {
                Ok(t) => t,
                Err(e) => {
                    warn!("undecodable transfer in chunk: {}", e);
                    failed += 1;
                    continue;
                }
            };
            // Mints only: anything else in the stream is ignored.
            if transfer.from != Address::zero() {
                continue;
            }

            let block_number = log.block_number.map(|b| b.as_u64());
            let tx_hash = log.transaction_hash;

            let minted_at = match block_number {
                Some(n) => self.resolve_block_timestamp(n).await * 1000,
                None => 0,
            };
            let (mint_price, mint_tx_hash) = match tx_hash {
                Some(hash) => (self.resolve_mint_price(hash).await, format!("{:?}", hash)),
                None => (0.0, String::new()),
            };

            tokens.push(Token::minted(
                transfer.token_id.to_string(),
                format!("{:?}", transfer.to),
                minted_at,
                mint_tx_hash,
                mint_price,
            ));
        }

        (chunk.from_block, chunk.to_block, tokens, failed)
    }

    /// Block timestamp in epoch seconds, memoized per block; zero after
    /// retries are exhausted.
    async fn resolve_block_timestamp(&self, block: u64) -> u64 {
        if let Some(ts) = self.block_timestamps.lock().await.get(&block) {
            return *ts;
        }

        let _permit = self.gate.acquire().await.expect("lookup gate closed");
        let client = self.client.clone();
        let result = with_retry(
            || async {
                client
                    .get_block_timestamp(block)
                    .await
                    .map(|ts| ts.unwrap_or(0))
            },
            self.lookup_attempts,
            LOOKUP_RETRY_DELAY,
            "get_block_timestamp",
        )
        .await;

        let ts = match result {
            Ok(ts) => ts,
            Err(e) => {
                warn!("block {} timestamp unresolved, defaulting to 0: {}", block, e);
                0
            }
        };
        self.block_timestamps.lock().await.insert(block, ts);
        ts
    }

    /// Price paid per mint: transaction value divided by the number of
    /// transfer logs in the receipt, rounded to 4 decimals. Memoized per tx;
    /// zero after retries are exhausted.
    async fn resolve_mint_price(&self, hash: H256) -> f64 {
        if let Some(price) = self.tx_prices.lock().await.get(&hash) {
            return *price;
        }

        let _permit = self.gate.acquire().await.expect("lookup gate closed");
        let client = self.client.clone();
        let result = with_retry(
            || async {
                let tx = client.get_transaction(hash).await?;
                let receipt = client.get_transaction_receipt(hash).await?;
                Ok((tx, receipt))
            },
            self.lookup_attempts,
            LOOKUP_RETRY_DELAY,
            "get_transaction",
        )
        .await;

        let price = match result {
            Ok((Some(tx), Some(receipt))) => {
                let transfers = receipt
                    .logs
                    .iter()
                    .filter(|l| l.topics.first() == Some(&*TRANSFER_TOPIC))
                    .count()
                    .max(1);
                let value_eth = ethers::utils::format_units(tx.value, "ether")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                round4(value_eth / transfers as f64)
            }
            Ok(_) => 0.0,
            Err(e) => {
                warn!("mint price for {:?} unresolved, defaulting to 0: {}", hash, e);
                0.0
            }
        };
        self.tx_prices.lock().await.insert(hash, price);
        price
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
