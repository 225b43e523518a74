//! Per-collection state machine
//!
//! Drives the creation pipeline in order: CollectionCreator ->
//! CollectionMetadata -> CollectionMints -> TokenMetadata ->
//! AggregateMetadata -> Complete. The step is persisted after every
//! transition, so a restarted run resumes where the last one stopped.
//!
//! Token machines for one collection run concurrently with no ordering
//! guarantee, but none passes the Aggregate step until all have arrived
//! there: trait aggregation must see the complete set.

use crate::config::PipelineConfig;
use crate::contract::{adapter_for, aggregate_traits, ContractAdapter};
use crate::error::{Error, Result};
use crate::fetch::{BlobStore, CollectionStatsProvider, MetadataFetcher};
use crate::mints::{MintCollector, ProgressSink};
use crate::model::{
    attribute_path, collection_path, normalize_address, now_ms, token_path, Collection,
    CreateState, CreationStep, RefreshStep, Token,
};
use crate::paginator::{LogPaginator, PaginateConfig, ToBlock};
use crate::pipeline::rarity::{RarityInjection, RarityScorer};
use crate::pipeline::token::{TokenMachine, TokenOutcome, TokenStepContext};
use crate::provider::{parse_address, with_retry, ProviderHandle, ProviderPool};
use crate::store::batch::BatchWriteBuffer;
use crate::store::{list_all, DocStore, DocWrite};
use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

const LIST_PAGE_SIZE: usize = 300;
const CREATOR_ATTEMPTS: u32 = 3;

/// Shared dependencies for collection runs. Construction is explicit; there
/// is no ambient registry.
pub struct PipelineContext {
    pub store: Arc<dyn DocStore>,
    pub providers: Arc<ProviderPool>,
    pub fetcher: Arc<MetadataFetcher>,
    pub blob: Arc<dyn BlobStore>,
    pub stats: Arc<dyn CollectionStatsProvider>,
    pub scorer: RarityScorer,
    pub pipeline: PipelineConfig,
}

pub struct CollectionRunner {
    ctx: Arc<PipelineContext>,
}

impl CollectionRunner {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    fn paginate_cfg(&self) -> PaginateConfig {
        PaginateConfig {
            page_size: self.ctx.pipeline.page_size,
            uncle_safety_margin: self.ctx.pipeline.uncle_safety_margin,
            max_attempts: self.ctx.pipeline.paginate_attempts,
            retry_delay: self.ctx.pipeline.paginate_retry_delay,
            ..PaginateConfig::default()
        }
    }

    /// Run the collection pipeline from its persisted step to Complete.
    /// Persists step and error state after every transition; errors bubble
    /// to the queue, which decides whether to restart the run.
    #[instrument(skip(self), fields(chain = chain_id, address = address))]
    pub async fn run(&self, chain_id: &str, address: &str) -> Result<()> {
        let path = collection_path(chain_id, address);
        let mut collection = match self.ctx.store.get(&path).await? {
            Some(doc) => serde_json::from_value(doc)
                .unwrap_or_else(|_| Collection::new(chain_id, address)),
            None => Collection::new(chain_id, address),
        };
        collection.chain_id = chain_id.to_string();
        collection.address = normalize_address(address);

        let client = self.ctx.providers.get(chain_id)?;
        let contract = parse_address(&collection.address)?;
        let adapter = adapter_for(
            collection.token_standard,
            chain_id,
            contract,
            client.clone(),
            self.paginate_cfg(),
        );

        loop {
            let step = collection.state.create.step;
            match step {
                CreationStep::Complete => return Ok(()),
                CreationStep::Unknown => {
                    // The stored failure point isn't trusted; restart the
                    // whole pipeline.
                    info!("collection {} in unknown state, restarting pipeline", path);
                    collection.state.create = CreateState::default();
                    self.persist(&collection).await?;
                    continue;
                }
                _ => {}
            }

            info!("collection {} running step {}", path, step);
            let result = match step {
                CreationStep::CollectionCreator => {
                    self.step_creator(&mut collection, &adapter).await
                }
                CreationStep::CollectionMetadata => {
                    self.step_collection_metadata(&mut collection).await
                }
                CreationStep::CollectionMints => {
                    self.step_mints(&mut collection, client.clone(), &adapter)
                        .await
                }
                CreationStep::TokenMetadata => {
                    self.step_token_metadata(&collection, &adapter).await
                }
                CreationStep::AggregateMetadata => self.step_aggregate(&mut collection).await,
                CreationStep::Complete | CreationStep::Unknown => unreachable!(),
            };

            match result {
                Ok(next) => {
                    info!("collection {} advanced {} -> {}", path, step, next);
                    collection.state.create.step = next;
                    collection.state.create.updated_at = now_ms();
                    collection.state.create.error = None;
                    self.persist(&collection).await?;
                }
                Err(e) => {
                    error!("collection {} failed at step {}: {}", path, step, e);
                    collection.state.create.error = Some(e.to_stored());
                    collection.state.create.updated_at = now_ms();
                    self.persist(&collection).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn persist(&self, collection: &Collection) -> Result<()> {
        self.ctx
            .store
            .set(&collection.path(), serde_json::to_value(collection)?)
            .await
    }

    /// Resolve deployer and owner. The owner falls back to the deployer when
    /// the contract is unowned or the owner is the null address.
    async fn step_creator(
        &self,
        collection: &mut Collection,
        adapter: &Arc<dyn ContractAdapter>,
    ) -> Result<CreationStep> {
        let event = with_retry(
            || adapter.creation_event(),
            CREATOR_ATTEMPTS,
            Duration::from_millis(500),
            "creation_event",
        )
        .await
        .map_err(|e| Error::collection_step(CreationStep::CollectionCreator, e.to_string()))?;

        let deployer = adapter
            .decode_deployer(&event)
            .map_err(|e| Error::collection_step(CreationStep::CollectionCreator, e.to_string()))?;
        collection.deployer = format!("{:?}", deployer);
        collection.deployed_at_block = event.block_number.map(|b| b.as_u64()).unwrap_or(0);

        let owner = adapter
            .owner()
            .await
            .map_err(|e| Error::collection_step(CreationStep::CollectionCreator, e.to_string()))?;
        collection.owner = if owner.is_empty() || owner == format!("{:?}", Address::zero()) {
            collection.deployer.clone()
        } else {
            owner
        };

        Ok(CreationStep::CollectionMetadata)
    }

    async fn step_collection_metadata(&self, collection: &mut Collection) -> Result<CreationStep> {
        collection.metadata = self
            .ctx
            .stats
            .collection_metadata(&collection.chain_id, &collection.address)
            .await
            .map_err(|e| Error::collection_step(CreationStep::CollectionMetadata, e.to_string()))?;
        Ok(CreationStep::CollectionMints)
    }

    /// Stream mint events through the collector and persist one token
    /// document per newly discovered token id. Resumes from the persisted
    /// cursor rather than the creation block when a prior attempt stopped
    /// short.
    async fn step_mints(
        &self,
        collection: &mut Collection,
        client: ProviderHandle,
        adapter: &Arc<dyn ContractAdapter>,
    ) -> Result<CreationStep> {
        let from_block = collection
            .state
            .create
            .mint_cursor
            .unwrap_or(collection.deployed_at_block);
        info!(
            "collecting mints for {} from block {}",
            collection.path(),
            from_block
        );

        let paginator = LogPaginator::new(client.clone(), self.paginate_cfg());
        let chunks = paginator.stream(adapter.mint_query(), from_block, ToBlock::Latest);
        let collector = MintCollector::new(
            client,
            adapter.clone(),
            self.ctx.pipeline.mint_gate,
            self.ctx.pipeline.chunk_concurrency,
            self.ctx.pipeline.lookup_attempts,
        );

        let progress_store = self.ctx.store.clone();
        let progress_path = collection.path();
        let progress: ProgressSink = Arc::new(move |p| {
            let store = progress_store.clone();
            let path = progress_path.clone();
            tokio::spawn(async move {
                let patch = serde_json::json!({ "state": { "create": { "progress": p } } });
                if let Err(e) = store.merge(&path, patch).await {
                    warn!("progress update for {} failed: {}", path, e);
                }
            });
        });

        let batch = collector.collect(chunks, from_block, progress).await;

        // The paginator does not dedupe; token id is the dedup key, and
        // tokens already persisted by a previous attempt must not regress.
        let prefix = format!("{}/nfts/", collection.path());
        let existing: HashSet<String> = list_all(&*self.ctx.store, &prefix, LIST_PAGE_SIZE)
            .await?
            .into_iter()
            .filter_map(|(p, _)| p.strip_prefix(&prefix).map(str::to_string))
            .collect();

        let (writer_tx, writer) = spawn_writer(self.ctx.store.clone());
        let mut new_ids: HashSet<String> = HashSet::new();
        for token in batch.tokens {
            if existing.contains(&token.token_id) || !new_ids.insert(token.token_id.clone()) {
                continue;
            }
            let write = DocWrite::set(
                token_path(&collection.chain_id, &collection.address, &token.token_id),
                serde_json::to_value(&token)?,
            );
            if writer_tx.send(write).await.is_err() {
                break;
            }
        }
        drop(writer_tx);
        writer
            .await
            .map_err(|e| Error::store(format!("token writer panicked: {}", e)))??;

        collection.num_nfts = (existing.len() + new_ids.len()) as u64;
        collection.state.create.mint_cursor = Some(batch.last_successful_block);

        if batch.failed_with_unknown_errors > 0 {
            warn!(
                "{} transfer events were undecodable while collecting {}",
                batch.failed_with_unknown_errors,
                collection.path()
            );
        }

        if !batch.got_all_blocks {
            return Err(Error::collection_step(
                CreationStep::CollectionMints,
                format!(
                    "pagination stopped early, resuming from block {} next attempt",
                    batch.last_successful_block
                ),
            ));
        }

        collection.state.create.progress = 100.0;
        Ok(CreationStep::TokenMetadata)
    }

    /// Drive one token machine per discovered mint, concurrently under a
    /// bounded pool. Machines stop at the Aggregate barrier; the step only
    /// advances once every token has usable metadata.
    async fn step_token_metadata(
        &self,
        collection: &Collection,
        adapter: &Arc<dyn ContractAdapter>,
    ) -> Result<CreationStep> {
        let prefix = format!("{}/nfts/", collection.path());
        let docs = list_all(&*self.ctx.store, &prefix, LIST_PAGE_SIZE).await?;
        let total = docs.len();

        let step_ctx = Arc::new(TokenStepContext {
            chain_id: collection.chain_id.clone(),
            collection_address: collection.address.clone(),
            adapter: adapter.clone(),
            fetcher: self.ctx.fetcher.clone(),
            blob: self.ctx.blob.clone(),
        });
        let (writer_tx, writer) = spawn_writer(self.ctx.store.clone());
        let sem = Arc::new(Semaphore::new(self.ctx.pipeline.token_concurrency));
        let mut join: JoinSet<bool> = JoinSet::new();
        let mut failed = 0usize;

        for (path, doc) in docs {
            let token: Token = match serde_json::from_value(doc) {
                Ok(t) => t,
                Err(e) => {
                    warn!("token document {} is unreadable: {}", path, e);
                    failed += 1;
                    continue;
                }
            };
            // Already at the barrier or finished from a previous run.
            if matches!(
                token.state.metadata.step,
                RefreshStep::Aggregate | RefreshStep::Complete
            ) && token.state.metadata.error.is_none()
            {
                continue;
            }

            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .expect("token semaphore closed");
            let ctx = step_ctx.clone();
            let writer_tx = writer_tx.clone();
            join.spawn(async move {
                let _permit = permit;
                let mut machine = TokenMachine::new(token, false);
                loop {
                    match machine.advance(&ctx).await {
                        TokenOutcome::Advanced => {
                            send_snapshot(&writer_tx, &path, machine.token()).await;
                        }
                        TokenOutcome::Suspended | TokenOutcome::Complete => {
                            send_snapshot(&writer_tx, &path, machine.token()).await;
                            return true;
                        }
                        TokenOutcome::Failed(_) => {
                            send_snapshot(&writer_tx, &path, machine.token()).await;
                            return false;
                        }
                    }
                }
            });
        }

        while let Some(result) = join.join_next().await {
            match result {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(e) => {
                    warn!("token task panicked: {}", e);
                    failed += 1;
                }
            }
        }
        drop(writer_tx);
        writer
            .await
            .map_err(|e| Error::store(format!("token writer panicked: {}", e)))??;

        if failed > 0 {
            return Err(Error::collection_step(
                CreationStep::TokenMetadata,
                format!("{} of {} tokens failed metadata refresh", failed, total),
            ));
        }
        Ok(CreationStep::AggregateMetadata)
    }

    /// Release the barrier: compute collection-wide trait counts and rarity,
    /// then resume every suspended token machine with its assignment.
    async fn step_aggregate(&self, collection: &mut Collection) -> Result<CreationStep> {
        let prefix = format!("{}/nfts/", collection.path());
        let docs = list_all(&*self.ctx.store, &prefix, LIST_PAGE_SIZE).await?;

        let mut entries: Vec<(String, Token)> = Vec::with_capacity(docs.len());
        for (path, doc) in docs {
            let token: Token = serde_json::from_value(doc).map_err(|e| {
                Error::collection_step(
                    CreationStep::AggregateMetadata,
                    format!("token document {} is unreadable: {}", path, e),
                )
            })?;
            entries.push((path, token));
        }

        // Aggregates are only safe once every token has usable metadata,
        // meaning it reached the barrier. A token stuck before it (with or
        // without a stored error) blocks the whole release.
        let not_ready = entries
            .iter()
            .filter(|(_, t)| t.state.metadata.step.index() < RefreshStep::Aggregate.index())
            .count();
        if not_ready > 0 {
            return Err(Error::collection_step(
                CreationStep::AggregateMetadata,
                format!("{} tokens are not ready for aggregation", not_ready),
            ));
        }

        let tokens: Vec<Token> = entries.iter().map(|(_, t)| t.clone()).collect();
        let attributes = aggregate_traits(&tokens);
        let assignments: HashMap<String, RarityInjection> = (self.ctx.scorer)(&tokens)
            .into_iter()
            .map(|a| {
                (
                    a.token_id,
                    RarityInjection {
                        rarity_score: Some(a.rarity_score),
                        rarity_rank: Some(a.rarity_rank),
                    },
                )
            })
            .collect();

        let (writer_tx, writer) = spawn_writer(self.ctx.store.clone());
        let mut failed = 0usize;
        for (path, token) in entries.iter() {
            if token.state.metadata.step == RefreshStep::Complete {
                continue;
            }
            let mut machine = TokenMachine::new(token.clone(), false);
            let injection = assignments
                .get(&machine.token().token_id)
                .copied()
                .unwrap_or_default();
            match machine.resume(injection) {
                TokenOutcome::Complete => {}
                TokenOutcome::Failed(_) => failed += 1,
                other => {
                    warn!("unexpected resume outcome for {}: {:?}", path, other);
                    failed += 1;
                }
            }
            send_snapshot(&writer_tx, path, machine.token()).await;
        }

        for (trait_type, values) in &attributes {
            let doc = serde_json::json!({ "traitType": trait_type, "values": values });
            let write = DocWrite::set(
                attribute_path(&collection.chain_id, &collection.address, trait_type),
                doc,
            );
            if writer_tx.send(write).await.is_err() {
                break;
            }
        }
        drop(writer_tx);
        writer
            .await
            .map_err(|e| Error::store(format!("token writer panicked: {}", e)))??;

        if failed > 0 {
            return Err(Error::collection_step(
                CreationStep::AggregateMetadata,
                format!("{} tokens rejected their rarity assignment", failed),
            ));
        }

        collection.attributes = attributes;
        collection.num_nfts = entries.len() as u64;
        collection.state.create.progress = 100.0;
        Ok(CreationStep::Complete)
    }
}

/// Single-owner write pump: one buffer per logical task, fed over a channel
/// so concurrent token machines never share it.
fn spawn_writer(
    store: Arc<dyn DocStore>,
) -> (
    mpsc::Sender<DocWrite>,
    tokio::task::JoinHandle<Result<()>>,
) {
    let (tx, mut rx) = mpsc::channel::<DocWrite>(256);
    let handle = tokio::spawn(async move {
        let mut buffer = BatchWriteBuffer::new(store);
        while let Some(write) = rx.recv().await {
            buffer.add(write).await?;
        }
        buffer.flush().await
    });
    (tx, handle)
}

async fn send_snapshot(tx: &mpsc::Sender<DocWrite>, path: &str, token: &Token) {
    match serde_json::to_value(token) {
        Ok(doc) => {
            if tx.send(DocWrite::set(path, doc)).await.is_err() {
                warn!("token writer is gone, dropping snapshot for {}", path);
            }
        }
        Err(e) => warn!("token snapshot for {} is unserializable: {}", path, e),
    }
}
