//! Document store abstraction
//!
//! The store is the single source of truth and the only synchronization
//! point between workers: claim races are resolved here, transactionally.
//! Documents are JSON values addressed by logical path
//! (`collections/{chainId}:{address}`, nested `/nfts/{tokenId}` and
//! `/attributes/{traitType}` sub-documents).
//!
//! Two implementations: [`memory::MemoryDocStore`] for tests and local runs,
//! and [`postgres::PgDocStore`] holding documents as JSONB rows.

pub mod batch;
pub mod memory;
pub mod postgres;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

/// A single buffered write.
#[derive(Debug, Clone)]
pub struct DocWrite {
    pub path: String,
    pub kind: WriteKind,
    pub doc: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Merge,
}

impl DocWrite {
    pub fn set(path: impl Into<String>, doc: Value) -> Self {
        Self {
            path: path.into(),
            kind: WriteKind::Set,
            doc,
        }
    }

    pub fn merge(path: impl Into<String>, doc: Value) -> Self {
        Self {
            path: path.into(),
            kind: WriteKind::Merge,
            doc,
        }
    }
}

/// The oldest unclaimed queued collection, as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCandidate {
    pub path: String,
    pub enqueued_at: u64,
}

#[async_trait]
pub trait DocStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    async fn set(&self, path: &str, doc: Value) -> Result<()>;

    /// Deep-merge a patch into the document, creating it if absent.
    async fn merge(&self, path: &str, patch: Value) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Commit a batch of writes in one transaction.
    async fn commit(&self, writes: &[DocWrite]) -> Result<()>;

    /// One page of a prefix scan, ordered by path.
    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>>;

    /// Claim the collection document: set `state.queue.claimedAt = now_ms`
    /// iff it is currently 0, atomically. Exactly one concurrent claimant
    /// wins. Returns whether this caller won.
    async fn try_claim(&self, path: &str, now_ms: u64) -> Result<bool>;

    /// Latest-value subscription to the oldest unclaimed queued collection.
    /// A slow consumer only ever sees the most recent snapshot.
    fn watch_queue(&self) -> watch::Receiver<Option<QueueCandidate>>;
}

/// Drain a prefix scan into memory, paging under the hood.
pub async fn list_all(
    store: &dyn DocStore,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store.list(prefix, cursor.as_deref(), page_size).await?;
        let Some((last, _)) = page.last() else {
            break;
        };
        cursor = Some(last.clone());
        let full = page.len() == page_size;
        out.extend(page);
        if !full {
            break;
        }
    }
    Ok(out)
}

/// Recursive JSON merge: objects merge key-by-key, everything else replaces.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, _) => *base_slot = patch.clone(),
    }
}

/// `true` if the path names a collection document rather than a nested
/// token/attribute sub-document.
pub fn is_collection_doc(path: &str) -> bool {
    path.strip_prefix("collections/")
        .is_some_and(|rest| !rest.contains('/'))
}

/// Pull `state.queue.{claimedAt,enqueuedAt}` out of a raw document.
pub(crate) fn queue_fields(doc: &Value) -> (u64, u64) {
    let claimed = doc
        .pointer("/state/queue/claimedAt")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let enqueued = doc
        .pointer("/state/queue/enqueuedAt")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (claimed, enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_nested() {
        let mut base = json!({
            "address": "0xabc",
            "state": { "create": { "step": "collection-creator", "progress": 0.0 } }
        });
        deep_merge(
            &mut base,
            &json!({ "state": { "create": { "progress": 42.5 } } }),
        );
        assert_eq!(base["state"]["create"]["step"], "collection-creator");
        assert_eq!(base["state"]["create"]["progress"], 42.5);
        assert_eq!(base["address"], "0xabc");
    }

    #[test]
    fn test_deep_merge_replaces_scalars_and_arrays() {
        let mut base = json!({ "tags": [1, 2], "n": 1 });
        deep_merge(&mut base, &json!({ "tags": [3], "n": 2 }));
        assert_eq!(base["tags"], json!([3]));
        assert_eq!(base["n"], 2);
    }

    #[test]
    fn test_is_collection_doc() {
        assert!(is_collection_doc("collections/1:0xabc"));
        assert!(!is_collection_doc("collections/1:0xabc/nfts/1"));
        assert!(!is_collection_doc("collections/1:0xabc/attributes/Background"));
        assert!(!is_collection_doc("other/1:0xabc"));
    }
}
