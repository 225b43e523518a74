//! Batched document writes
//!
//! Accumulates writes until a count or serialized-size threshold, then
//! flushes the full batch asynchronously while new writes keep accumulating
//! into a fresh one. Commit failures are retried with a fixed delay matched
//! to the store's per-document write-rate ceiling.
//!
//! One buffer per logical task: `add` is not safe for concurrent writers
//! across tasks, and multiple workers must use separate instances.

use crate::error::{Error, Result};
use crate::store::{DocStore, DocWrite};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum writes per batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Fixed per-request payload limit of the store.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Flush once the accumulated serialized payload approaches the limit.
pub const PAYLOAD_CEILING_BYTES: usize = MAX_PAYLOAD_BYTES / 4 * 3;

const FLUSH_ATTEMPTS: u32 = 5;
const FLUSH_RETRY_DELAY: Duration = Duration::from_secs(3);

pub struct BatchWriteBuffer {
    store: Arc<dyn DocStore>,
    writes: Vec<DocWrite>,
    bytes: usize,
    in_flight: Option<JoinHandle<Result<()>>>,
    flush_attempts: u32,
    flush_retry_delay: Duration,
}

impl BatchWriteBuffer {
    pub fn new(store: Arc<dyn DocStore>) -> Self {
        Self {
            store,
            writes: Vec::new(),
            bytes: 0,
            in_flight: None,
            flush_attempts: FLUSH_ATTEMPTS,
            flush_retry_delay: FLUSH_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.flush_attempts = attempts;
        self.flush_retry_delay = delay;
        self
    }

    /// Number of writes waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    /// Queue a write. When the batch would reach its count threshold or the
    /// byte ceiling, the previous batch is handed to an async flush first, so
    /// the triggering write counts against the fresh batch.
    pub async fn add(&mut self, write: DocWrite) -> Result<()> {
        let size = write.path.len() + serde_json::to_vec(&write.doc)?.len();

        if self.writes.len() + 1 >= MAX_BATCH_SIZE || self.bytes + size > PAYLOAD_CEILING_BYTES {
            self.rotate().await?;
        }

        self.bytes += size;
        self.writes.push(write);
        Ok(())
    }

    /// Flush everything and wait for it to land.
    pub async fn flush(&mut self) -> Result<()> {
        self.rotate().await?;
        self.join_in_flight().await
    }

    /// Hand the current batch to a background commit. Waits for any previous
    /// in-flight commit first so at most one flush runs at a time.
    async fn rotate(&mut self) -> Result<()> {
        self.join_in_flight().await?;

        if self.writes.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.writes);
        self.bytes = 0;
        debug!("flushing batch of {} writes", batch.len());

        let store = self.store.clone();
        let attempts = self.flush_attempts;
        let delay = self.flush_retry_delay;
        self.in_flight = Some(tokio::spawn(async move {
            commit_with_retry(store, batch, attempts, delay).await
        }));

        Ok(())
    }

    async fn join_in_flight(&mut self) -> Result<()> {
        if let Some(handle) = self.in_flight.take() {
            handle
                .await
                .map_err(|e| Error::store(format!("flush task panicked: {}", e)))??;
        }
        Ok(())
    }
}

/// Commit the whole batch, retrying transient failures. The fatal error
/// names one sample document path for diagnosis.
async fn commit_with_retry(
    store: Arc<dyn DocStore>,
    batch: Vec<DocWrite>,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let mut last_err = None;

    for attempt in 1..=attempts {
        match store.commit(&batch).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "batch commit of {} writes failed (attempt {}/{}): {}",
                    batch.len(),
                    attempt,
                    attempts,
                    e
                );
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let sample_path = batch
        .first()
        .map(|w| w.path.clone())
        .unwrap_or_else(|| "<empty>".to_string());
    warn!(
        "batch commit permanently failed, sample document: {} ({:?})",
        sample_path, last_err
    );
    Err(Error::BatchCommitFailed {
        attempts,
        sample_path,
    })
}
