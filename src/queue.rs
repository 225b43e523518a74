//! Distributed collection queue
//!
//! Serializes access to a FIFO-ish backlog of unclaimed collections across
//! any number of worker processes. The store's queue view delivers only the
//! single oldest unclaimed collection through a latest-value channel, so a
//! slow consumer samples the most recent snapshot instead of buffering
//! stale ones. Claims are resolved in the store: exactly one concurrent
//! claimant wins per collection document.
//!
//! The claim loop never terminates on error; giving up on queue-watching
//! would halt all indexing.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::model::{collection_path, now_ms, Collection, CreationStep};
use crate::pipeline::CollectionRunner;
use crate::store::{is_collection_doc, list_all, queue_fields, DocStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, instrument, warn};

const LIST_PAGE_SIZE: usize = 300;

/// What `enqueue_collection` decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Step is Complete; nothing to do.
    AlreadyComplete,
    /// A live claim is making progress; leave it alone.
    ActivelyClaimed,
    /// Stuck or errored; claim released and queue position refreshed.
    Requeued,
    /// Already waiting in the queue.
    AlreadyQueued,
    /// Entered the queue for the first time.
    Enqueued,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOverrides {
    pub step: Option<CreationStep>,
    pub has_blue_check: Option<bool>,
    pub index_initiator: Option<String>,
}

/// Enqueue decision table, evaluated in exactly this precedence order:
/// 1. Complete -> no-op.
/// 2. Live claim that has advanced past the first step, or is still inside
///    the first-progress grace window, and carries no error -> no-op.
/// 3. Live claim that is stuck with no time-based excuse, or any stored
///    create-error -> re-enqueue.
/// 4. Already queued -> no-op.
/// 5. Otherwise -> fresh enqueue at CollectionCreator.
pub async fn enqueue_collection(
    store: &dyn DocStore,
    chain_id: &str,
    address: &str,
    timestamp: Option<u64>,
    overrides: Option<EnqueueOverrides>,
    cfg: &QueueConfig,
) -> Result<EnqueueOutcome> {
    let path = collection_path(chain_id, address);
    let now = now_ms();
    let enqueue_at = timestamp.unwrap_or(now);
    let overrides = overrides.unwrap_or_default();
    let doc = store.get(&path).await?;

    if let Some(doc) = &doc {
        let step = read_step(doc);
        let (claimed_at, enqueued_at) = queue_fields(doc);
        let has_error = doc
            .pointer("/state/create/error")
            .map_or(false, |v| !v.is_null());

        // 1. Already done.
        if step == CreationStep::Complete {
            return Ok(EnqueueOutcome::AlreadyComplete);
        }

        // 2 / 3. A live claim is judged by whether it has made progress.
        let claim_age = now.saturating_sub(claimed_at);
        if claimed_at != 0 && claim_age < cfg.claim_liveness.as_millis() as u64 {
            let advanced = step.has_advanced();
            let within_grace = claim_age < cfg.progress_grace.as_millis() as u64;
            if (advanced || within_grace) && !has_error {
                return Ok(EnqueueOutcome::ActivelyClaimed);
            }
            requeue(store, &path, enqueue_at, overrides.step).await?;
            return Ok(EnqueueOutcome::Requeued);
        }

        // 3 (continued). Errored collections are recovered regardless of
        // claim state.
        if has_error {
            requeue(store, &path, enqueue_at, overrides.step).await?;
            return Ok(EnqueueOutcome::Requeued);
        }

        // 4. Already waiting.
        if enqueued_at > 0 {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
    }

    // 5. Fresh enqueue.
    let mut collection = Collection::new(chain_id, address);
    collection.state.create.step = overrides.step.unwrap_or(CreationStep::CollectionCreator);
    collection.state.queue.enqueued_at = enqueue_at;
    collection.state.queue.claimed_at = 0;
    if let Some(blue) = overrides.has_blue_check {
        collection.has_blue_check = blue;
    }
    if let Some(initiator) = overrides.index_initiator {
        collection.index_initiator = initiator;
    }
    store
        .merge(&path, serde_json::to_value(&collection)?)
        .await?;
    Ok(EnqueueOutcome::Enqueued)
}

/// Release the claim and refresh the queue position. Progress already made
/// (step, mint cursor, token documents) is untouched unless a step override
/// says otherwise; the stored error is consumed by the requeue decision.
async fn requeue(
    store: &dyn DocStore,
    path: &str,
    enqueue_at: u64,
    step_override: Option<CreationStep>,
) -> Result<()> {
    let mut patch = serde_json::json!({
        "state": {
            "queue": { "claimedAt": 0, "enqueuedAt": enqueue_at },
            "create": { "error": null, "updatedAt": now_ms() }
        }
    });
    if let Some(step) = step_override {
        patch["state"]["create"]["step"] = serde_json::to_value(step)?;
    }
    store.merge(path, patch).await
}

fn read_step(doc: &Value) -> CreationStep {
    doc.pointer("/state/create/step")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(CreationStep::Unknown)
}

/// Split `collections/{chainId}:{address}` back into its parts.
pub fn parse_collection_path(path: &str) -> Option<(String, String)> {
    let key = path.strip_prefix("collections/")?;
    let (chain_id, address) = key.split_once(':')?;
    if chain_id.is_empty() || address.is_empty() || address.contains('/') {
        return None;
    }
    Some((chain_id.to_string(), address.to_string()))
}

// ============================================================================
// Queue worker
// ============================================================================

pub struct CollectionQueue {
    store: Arc<dyn DocStore>,
    runner: Arc<CollectionRunner>,
    cfg: QueueConfig,
}

impl CollectionQueue {
    pub fn new(store: Arc<dyn DocStore>, runner: Arc<CollectionRunner>, cfg: QueueConfig) -> Arc<Self> {
        Arc::new(Self { store, runner, cfg })
    }

    /// Claim loop: hold a worker slot, wait for the oldest unclaimed
    /// candidate, race for the claim, dispatch the winner. A completed run
    /// frees its slot, which immediately re-arms the loop for the next
    /// claim attempt.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("collection queue started ({} workers)", self.cfg.workers);
        let workers = Arc::new(Semaphore::new(self.cfg.workers));
        let mut queue_rx = self.store.watch_queue();

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                permit = workers.clone().acquire_owned() => {
                    permit.expect("worker semaphore closed")
                }
            };

            // Sampling, not queueing: always act on the latest snapshot.
            let candidate = loop {
                if let Some(candidate) = queue_rx.borrow_and_update().clone() {
                    break candidate;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return,
                    changed = queue_rx.changed() => {
                        if changed.is_err() {
                            warn!("queue view closed, stopping claim loop");
                            return;
                        }
                    }
                }
            };

            match self.store.try_claim(&candidate.path, now_ms()).await {
                Ok(true) => {
                    info!("claimed {}", candidate.path);
                    let queue = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        queue.run_collection(&candidate.path).await;
                    });
                }
                Ok(false) => {
                    // Another worker won; wait for the view to move on
                    // before retrying so a stale snapshot can't spin.
                    debug!("lost claim race for {}", candidate.path);
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = queue_rx.changed() => {}
                    }
                }
                Err(e) => {
                    error!("claim attempt for {} failed: {}", candidate.path, e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }

        info!("collection queue shutting down");
    }

    /// Run one claimed collection, restarting the whole run a bounded number
    /// of times on escaping errors. Each restart resumes from the persisted
    /// step.
    async fn run_collection(&self, path: &str) {
        let Some((chain_id, address)) = parse_collection_path(path) else {
            warn!("claimed document has a malformed path: {}", path);
            return;
        };

        for attempt in 1..=self.cfg.max_run_attempts {
            match self.runner.run(&chain_id, &address).await {
                Ok(()) => {
                    info!("collection {} complete", path);
                    return;
                }
                Err(e) => {
                    warn!(
                        "collection {} run failed (attempt {}/{}): {}",
                        path, attempt, self.cfg.max_run_attempts, e
                    );
                }
            }
        }
        // The last step/error is already persisted by the runner; the
        // monitor picks the collection up from there.
        error!(
            "collection {} permanently failed after {} attempts",
            path, self.cfg.max_run_attempts
        );
    }

    /// Background monitor: re-enqueue collections with a stale claim or a
    /// persisted create-error. Runs independently of the claim loop.
    #[instrument(skip(self, shutdown))]
    pub async fn monitor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "queue monitor started (interval {:?}, staleness {:?})",
            self.cfg.monitor_interval, self.cfg.claim_stale
        );
        let mut ticker = tokio::time::interval(self.cfg.monitor_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_for_stuck().await {
                        error!("monitor scan failed: {}", e);
                    }
                }
            }
        }

        info!("queue monitor shutting down");
    }

    async fn scan_for_stuck(&self) -> Result<()> {
        let docs = list_all(&*self.store, "collections/", LIST_PAGE_SIZE).await?;
        let now = now_ms();
        let stale = self.cfg.claim_stale.as_millis() as u64;
        let mut requeued = 0usize;

        for (path, doc) in docs.iter().filter(|(p, _)| is_collection_doc(p)) {
            if read_step(doc) == CreationStep::Complete {
                continue;
            }
            let (claimed_at, _) = queue_fields(doc);
            let has_error = doc
                .pointer("/state/create/error")
                .map_or(false, |v| !v.is_null());
            let stale_claim = claimed_at != 0 && now.saturating_sub(claimed_at) > stale;

            if stale_claim || has_error {
                info!(
                    "monitor requeueing {} (stale_claim: {}, error: {})",
                    path, stale_claim, has_error
                );
                requeue(&*self.store, path, now, None).await?;
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!("monitor requeued {} collection(s)", requeued);
        }
        Ok(())
    }
}
