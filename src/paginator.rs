//! Log pagination with adaptive window sizing
//!
//! Fetches all events matching a filter between `from_block` and an effective
//! max block, in windows no larger than the provider's 2000-block limit. The
//! window size adapts in both directions: it narrows when the provider rejects
//! a range as too large, and after a run of empty windows one widened query
//! covers the remaining tail in a single call (sparse-range optimization).
//!
//! Consumers differ in whether they want backpressure-aware streaming (mint
//! collection) or all-at-once materialization (count queries), so both are
//! offered: [`LogPaginator::stream`] and [`LogPaginator::collect`].
//!
//! Deduplication is the caller's responsibility; callers requiring
//! exactly-once semantics must dedupe by a caller-chosen key.

use crate::error::{Error, Result};
use crate::model::BlockCursor;
use crate::provider::ProviderHandle;
use ethers::types::Log;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A thunk that queries one block range for logs.
pub type RangeQuery = Arc<dyn Fn(u64, u64) -> BoxFuture<'static, Result<Vec<Log>>> + Send + Sync>;

/// One emitted page of events. `progress` is a monotonically non-decreasing
/// percentage of blocks covered so far, rounded to two decimals; it is for
/// status reporting, not correctness.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub events: Vec<Log>,
    pub from_block: u64,
    pub to_block: u64,
    pub progress: f64,
}

/// Upper bound of a pagination run.
#[derive(Debug, Clone, Copy)]
pub enum ToBlock {
    /// Current chain head minus the uncle-safety margin.
    Latest,
    Block(u64),
}

#[derive(Debug, Clone)]
pub struct PaginateConfig {
    /// Initial window size; also the provider's hard per-query limit.
    pub page_size: u64,
    /// Blocks subtracted from head before treating a block as final.
    pub uncle_safety_margin: u64,
    /// Attempts per window for transient errors.
    pub max_attempts: u32,
    /// Fixed backoff between transient retries.
    pub retry_delay: Duration,
    /// Consecutive empty windows before attempting one widened query.
    pub widen_after_empty: u32,
    /// Channel capacity for streamed chunks.
    pub channel_capacity: usize,
}

impl Default for PaginateConfig {
    fn default() -> Self {
        Self {
            page_size: 2000,
            uncle_safety_margin: 6,
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            widen_after_empty: 5,
            channel_capacity: 8,
        }
    }
}

pub struct LogPaginator {
    client: ProviderHandle,
    cfg: PaginateConfig,
}

impl LogPaginator {
    pub fn new(client: ProviderHandle, cfg: PaginateConfig) -> Self {
        Self { client, cfg }
    }

    /// Walk the range, emitting chunks through a bounded channel. Block
    /// ranges are processed in increasing order; the receiver applies
    /// backpressure through the channel capacity.
    pub fn stream(
        &self,
        query: RangeQuery,
        from_block: u64,
        to_block: ToBlock,
    ) -> mpsc::Receiver<Result<LogChunk>> {
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);
        let client = self.client.clone();
        let cfg = self.cfg.clone();

        tokio::spawn(async move {
            if let Err(e) = walk(client, cfg, query, from_block, to_block, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    /// Materialize the full event list for the range.
    pub async fn collect(
        &self,
        query: RangeQuery,
        from_block: u64,
        to_block: ToBlock,
    ) -> Result<Vec<Log>> {
        let mut rx = self.stream(query, from_block, to_block);
        let mut events = Vec::new();
        while let Some(chunk) = rx.recv().await {
            events.extend(chunk?.events);
        }
        Ok(events)
    }
}

async fn walk(
    client: ProviderHandle,
    cfg: PaginateConfig,
    query: RangeQuery,
    from_block: u64,
    to_block: ToBlock,
    tx: &mpsc::Sender<Result<LogChunk>>,
) -> Result<()> {
    let max_block = match to_block {
        ToBlock::Latest => {
            let head = client.get_block_number().await?;
            head.saturating_sub(cfg.uncle_safety_margin)
        }
        ToBlock::Block(b) => b,
    };

    if max_block < from_block {
        return Ok(());
    }

    let total_blocks = (max_block - from_block + 1) as f64;
    let mut cursor = BlockCursor {
        min_block: from_block,
        max_block,
        from: from_block,
        to: from_block,
        page_size: cfg.page_size,
    };
    let mut empty_streak = 0u32;
    let mut last_progress = 0.0f64;

    while cursor.from <= max_block {
        // Sparse ranges: after enough empty windows, try the whole tail in
        // one call. On failure, reset the streak and resume windowing.
        if empty_streak >= cfg.widen_after_empty && cursor.from + cursor.page_size <= max_block {
            match (query)(cursor.from, max_block).await {
                Ok(events) => {
                    debug!(
                        "widened query covered blocks {}..={} ({} events)",
                        cursor.from,
                        max_block,
                        events.len()
                    );
                    emit(
                        tx,
                        events,
                        cursor.from,
                        max_block,
                        from_block,
                        total_blocks,
                        &mut last_progress,
                    )
                    .await;
                    return Ok(());
                }
                Err(e) => {
                    debug!("widened query failed, resuming windowed scan: {}", e);
                    empty_streak = 0;
                }
            }
        }

        cursor.to = cursor
            .from
            .saturating_add(cursor.page_size.saturating_sub(1))
            .min(max_block);

        let events = query_window(&cfg, &query, &mut cursor).await?;
        empty_streak = if events.is_empty() { empty_streak + 1 } else { 0 };

        let sent = emit(
            tx,
            events,
            cursor.from,
            cursor.to,
            from_block,
            total_blocks,
            &mut last_progress,
        )
        .await;
        if !sent {
            // Receiver went away; nothing left to do.
            return Ok(());
        }

        cursor.from = cursor.to + 1;
    }

    Ok(())
}

/// Query one window, adapting to provider pushback. Range-too-large errors
/// narrow the window (or jump to the provider's recommended range) without
/// counting against the transient attempt budget; transient errors retry the
/// same window with fixed backoff; malformed-request errors propagate
/// immediately.
async fn query_window(
    cfg: &PaginateConfig,
    query: &RangeQuery,
    cursor: &mut BlockCursor,
) -> Result<Vec<Log>> {
    let mut attempts = 0u32;

    loop {
        match (query)(cursor.from, cursor.to).await {
            Ok(events) => return Ok(events),
            Err(Error::RangeTooLarge { message }) => {
                if let Some((start, end)) = parse_recommended_range(&message) {
                    if start >= cursor.from && end >= start {
                        cursor.from = start;
                        cursor.to = end.min(cursor.max_block);
                        cursor.page_size = cursor.to - cursor.from + 1;
                        debug!(
                            "provider recommended range, jumping to {}..={}",
                            cursor.from, cursor.to
                        );
                        continue;
                    }
                }
                if cursor.page_size <= 1 {
                    return Err(Error::RangeTooLarge { message });
                }
                cursor.page_size = (cursor.page_size / 2).max(1);
                cursor.to = cursor
                    .from
                    .saturating_add(cursor.page_size - 1)
                    .min(cursor.max_block);
                debug!(
                    "range too large, halving window to {} blocks",
                    cursor.page_size
                );
            }
            Err(e) if e.is_retryable() => {
                attempts += 1;
                if attempts >= cfg.max_attempts {
                    return Err(e);
                }
                warn!(
                    "log query {}..={} failed (attempt {}/{}): {}",
                    cursor.from, cursor.to, attempts, cfg.max_attempts, e
                );
                tokio::time::sleep(cfg.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Send a chunk downstream; returns false when the receiver is gone.
async fn emit(
    tx: &mpsc::Sender<Result<LogChunk>>,
    events: Vec<Log>,
    from_block: u64,
    to_block: u64,
    min_block: u64,
    total_blocks: f64,
    last_progress: &mut f64,
) -> bool {
    let covered = (to_block - min_block + 1) as f64;
    let progress = ((covered / total_blocks * 100.0) * 100.0).round() / 100.0;
    // Progress never regresses, even if rounding says otherwise.
    let progress = progress.max(*last_progress).min(100.0);
    *last_progress = progress;

    tx.send(Ok(LogChunk {
        events,
        from_block,
        to_block,
        progress,
    }))
    .await
    .is_ok()
}

/// Extract the `[0x…, 0x…]` range some providers embed in a range-too-large
/// error message.
pub fn parse_recommended_range(message: &str) -> Option<(u64, u64)> {
    let open = message.find('[')?;
    let close = message[open..].find(']')? + open;
    let inner = &message[open + 1..close];
    let mut parts = inner.split(',').map(str::trim);
    let start = parse_hex_or_dec(parts.next()?)?;
    let end = parse_hex_or_dec(parts.next()?)?;
    Some((start, end))
}

fn parse_hex_or_dec(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChainClient;
    use async_trait::async_trait;
    use ethers::types::{Address, Bytes, Filter, Transaction, TransactionReceipt, H256};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeHead(u64);

    #[async_trait]
    impl ChainClient for FakeHead {
        async fn get_block_number(&self) -> Result<u64> {
            Ok(self.0)
        }
        async fn get_block_timestamp(&self, _number: u64) -> Result<Option<u64>> {
            Ok(None)
        }
        async fn get_logs(&self, _filter: &Filter) -> Result<Vec<Log>> {
            Ok(vec![])
        }
        async fn get_transaction(&self, _hash: H256) -> Result<Option<Transaction>> {
            Ok(None)
        }
        async fn get_transaction_receipt(
            &self,
            _hash: H256,
        ) -> Result<Option<TransactionReceipt>> {
            Ok(None)
        }
        async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes> {
            Ok(Bytes::new())
        }
    }

    fn paginator(head: u64) -> LogPaginator {
        LogPaginator::new(
            Arc::new(FakeHead(head)),
            PaginateConfig {
                retry_delay: Duration::from_millis(1),
                ..PaginateConfig::default()
            },
        )
    }

    fn log_at(block: u64) -> Log {
        Log {
            block_number: Some(block.into()),
            ..Default::default()
        }
    }

    fn recording_query(
        windows: Arc<Mutex<Vec<(u64, u64)>>>,
        events_at: Vec<u64>,
    ) -> RangeQuery {
        Arc::new(move |from, to| {
            let windows = windows.clone();
            let events_at = events_at.clone();
            Box::pin(async move {
                windows.lock().unwrap().push((from, to));
                Ok(events_at
                    .iter()
                    .filter(|b| **b >= from && **b <= to)
                    .map(|b| log_at(*b))
                    .collect())
            })
        })
    }

    #[tokio::test]
    async fn test_windows_are_contiguous_bounded_and_complete() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let query = recording_query(windows.clone(), vec![10, 2500, 4999]);

        let mut rx = paginator(0).stream(query, 0, ToBlock::Block(4999));
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }

        let windows = windows.lock().unwrap();
        // Every window respects the provider limit.
        for (from, to) in windows.iter() {
            assert!(to - from + 1 <= 2000, "window {}..={} too wide", from, to);
        }
        // Chunks are contiguous, increasing, and cover the whole range.
        assert_eq!(chunks.first().unwrap().from_block, 0);
        assert_eq!(chunks.last().unwrap().to_block, 4999);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].to_block + 1, pair[1].from_block);
        }
        // Progress is monotone and ends at 100.
        for pair in chunks.windows(2) {
            assert!(pair[1].progress >= pair[0].progress);
        }
        assert_eq!(chunks.last().unwrap().progress, 100.0);
        // All three events surfaced.
        let total: usize = chunks.iter().map(|c| c.events.len()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_latest_applies_uncle_safety_margin() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let query = recording_query(windows.clone(), vec![]);

        let mut rx = paginator(1006).stream(query, 0, ToBlock::Latest);
        let mut last_to = 0;
        while let Some(chunk) = rx.recv().await {
            last_to = chunk.unwrap().to_block;
        }
        assert_eq!(last_to, 1000);
    }

    #[tokio::test]
    async fn test_narrows_on_range_too_large() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let windows_inner = windows.clone();
        // Provider rejects anything wider than 500 blocks.
        let query: RangeQuery = Arc::new(move |from, to| {
            let windows = windows_inner.clone();
            Box::pin(async move {
                if to - from + 1 > 500 {
                    return Err(Error::RangeTooLarge {
                        message: "block range too large".to_string(),
                    });
                }
                windows.lock().unwrap().push((from, to));
                Ok(vec![])
            })
        });

        let mut rx = paginator(0).stream(query, 0, ToBlock::Block(1999));
        let mut last_to = 0;
        while let Some(chunk) = rx.recv().await {
            last_to = chunk.unwrap().to_block;
        }

        assert_eq!(last_to, 1999);
        for (from, to) in windows.lock().unwrap().iter() {
            assert!(to - from + 1 <= 500);
        }
    }

    #[tokio::test]
    async fn test_jumps_to_recommended_range() {
        let first = AtomicU32::new(0);
        let windows = Arc::new(Mutex::new(Vec::new()));
        let windows_inner = windows.clone();
        let query: RangeQuery = Arc::new(move |from, to| {
            let is_first = first.fetch_add(1, Ordering::SeqCst) == 0;
            let windows = windows_inner.clone();
            Box::pin(async move {
                if is_first {
                    return Err(Error::RangeTooLarge {
                        message: "query exceeds limit, retry with this block range [0x0, 0x3e7]"
                            .to_string(),
                    });
                }
                windows.lock().unwrap().push((from, to));
                Ok(vec![])
            })
        });

        let mut rx = paginator(0).stream(query, 0, ToBlock::Block(4999));
        while rx.recv().await.is_some() {}

        let windows = windows.lock().unwrap();
        assert_eq!(windows[0], (0, 999));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_give_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();
        let query: RangeQuery = Arc::new(move |_, _| {
            let calls = calls_inner.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::blockchain("rpc hiccup"))
            })
        });

        let result = paginator(0).collect(query, 0, ToBlock::Block(100)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_fatal_errors_propagate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();
        let query: RangeQuery = Arc::new(move |_, _| {
            let calls = calls_inner.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidRpcRequest {
                    message: "invalid params".into(),
                })
            })
        });

        let result = paginator(0).collect(query, 0, ToBlock::Block(100)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_widens_after_empty_streak() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let query = recording_query(windows.clone(), vec![]);

        let mut rx = paginator(0).stream(query, 0, ToBlock::Block(99_999));
        while rx.recv().await.is_some() {}

        let windows = windows.lock().unwrap();
        // Five empty 2000-block windows, then one widened query to the end.
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[5], (10_000, 99_999));
    }

    #[test]
    fn test_parse_recommended_range() {
        assert_eq!(
            parse_recommended_range("retry with this block range [0x64, 0xc8]"),
            Some((100, 200))
        );
        assert_eq!(
            parse_recommended_range("valid range is [100, 200]"),
            Some((100, 200))
        );
        assert_eq!(parse_recommended_range("no range here"), None);
    }
}
