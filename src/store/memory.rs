//! In-memory document store
//!
//! Backs tests and local development runs. Claims are serialized through the
//! document mutex, which gives the same exactly-one-winner guarantee the
//! Postgres store gets from its conditional update.

use crate::error::Result;
use crate::store::{
    deep_merge, is_collection_doc, queue_fields, DocStore, DocWrite, QueueCandidate, WriteKind,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::watch;

pub struct MemoryDocStore {
    docs: Mutex<BTreeMap<String, Value>>,
    queue_tx: watch::Sender<Option<QueueCandidate>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        let (queue_tx, _) = watch::channel(None);
        Self {
            docs: Mutex::new(BTreeMap::new()),
            queue_tx,
        }
    }

    /// Recompute the oldest unclaimed queued collection and publish it.
    fn refresh_queue_view(&self, docs: &BTreeMap<String, Value>) {
        let candidate = docs
            .iter()
            .filter(|(path, _)| is_collection_doc(path))
            .filter_map(|(path, doc)| {
                let (claimed_at, enqueued_at) = queue_fields(doc);
                (claimed_at == 0 && enqueued_at > 0).then(|| QueueCandidate {
                    path: path.clone(),
                    enqueued_at,
                })
            })
            .min_by_key(|c| (c.enqueued_at, c.path.clone()));

        self.queue_tx.send_if_modified(|current| {
            if *current != candidate {
                *current = candidate;
                true
            } else {
                false
            }
        });
    }

    fn apply(docs: &mut BTreeMap<String, Value>, write: &DocWrite) {
        match write.kind {
            WriteKind::Set => {
                docs.insert(write.path.clone(), write.doc.clone());
            }
            WriteKind::Merge => match docs.get_mut(&write.path) {
                Some(existing) => deep_merge(existing, &write.doc),
                None => {
                    docs.insert(write.path.clone(), write.doc.clone());
                }
            },
        }
    }
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.docs.lock().unwrap().get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Value) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        docs.insert(path.to_string(), doc);
        self.refresh_queue_view(&docs);
        Ok(())
    }

    async fn merge(&self, path: &str, patch: Value) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        Self::apply(&mut docs, &DocWrite::merge(path, patch));
        self.refresh_queue_view(&docs);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        docs.remove(path);
        self.refresh_queue_view(&docs);
        Ok(())
    }

    async fn commit(&self, writes: &[DocWrite]) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        for write in writes {
            Self::apply(&mut docs, write);
        }
        self.refresh_queue_view(&docs);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter(|(path, _)| start_after.map_or(true, |after| path.as_str() > after))
            .take(limit)
            .map(|(path, doc)| (path.clone(), doc.clone()))
            .collect())
    }

    async fn try_claim(&self, path: &str, now_ms: u64) -> Result<bool> {
        let mut docs = self.docs.lock().unwrap();
        let Some(doc) = docs.get_mut(path) else {
            return Ok(false);
        };
        let (claimed_at, _) = queue_fields(doc);
        if claimed_at != 0 {
            return Ok(false);
        }
        deep_merge(
            doc,
            &serde_json::json!({ "state": { "queue": { "claimedAt": now_ms } } }),
        );
        self.refresh_queue_view(&docs);
        Ok(true)
    }

    fn watch_queue(&self) -> watch::Receiver<Option<QueueCandidate>> {
        self.queue_tx.subscribe()
    }
}
