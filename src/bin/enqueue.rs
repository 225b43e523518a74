//! Collection enqueue CLI
//!
//! Feeds collections into the indexing queue and exits. Accepts either a
//! batch file or a single address:
//!
//! ```text
//! enqueue file=collections.json
//! enqueue address=0xabc... chain=1 task=create hasBlueCheck=true
//! ```
//!
//! The batch file is a JSON array of `{ address, chainId?, hasBlueCheck? }`
//! entries (chain id defaults to "1"). Failures are logged without aborting
//! the rest of the batch; partial success is acceptable.

use mintstream::config::Config;
use mintstream::error::{Error, Result};
use mintstream::model::is_valid_address;
use mintstream::queue::{enqueue_collection, EnqueueOverrides};
use mintstream::store::memory::MemoryDocStore;
use mintstream::store::postgres::PgDocStore;
use mintstream::store::DocStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchEntry {
    address: String,
    #[serde(default = "default_chain_id")]
    chain_id: String,
    #[serde(default)]
    has_blue_check: Option<bool>,
}

fn default_chain_id() -> String {
    "1".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: HashMap<String, String> = std::env::args()
        .skip(1)
        .filter_map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let entries = if let Some(file) = args.get("file") {
        let raw = std::fs::read_to_string(file)?;
        serde_json::from_str::<Vec<BatchEntry>>(&raw)?
    } else if let Some(address) = args.get("address") {
        let task = args.get("task").map(String::as_str).unwrap_or("create");
        if task != "create" {
            return Err(Error::bad_request(format!("unsupported task: {}", task)));
        }
        vec![BatchEntry {
            address: address.clone(),
            chain_id: args
                .get("chain")
                .cloned()
                .unwrap_or_else(default_chain_id),
            has_blue_check: args
                .get("hasBlueCheck")
                .and_then(|v| v.parse::<bool>().ok()),
        }]
    } else {
        return Err(Error::bad_request(
            "usage: enqueue file=<path> | enqueue address=<addr> [chain=<id>] [task=create] [hasBlueCheck=true|false]",
        ));
    };

    if entries.is_empty() {
        warn!("nothing to enqueue");
        return Ok(());
    }

    let config = Config::from_env()?;
    let store: Arc<dyn DocStore> = match config.store.backend.as_str() {
        "memory" => Arc::new(MemoryDocStore::new()),
        _ => Arc::new(
            PgDocStore::connect(&config.store.database, config.store.queue_poll_interval).await?,
        ),
    };

    info!("enqueueing {} collection(s)", entries.len());
    let mut join = JoinSet::new();
    for entry in entries {
        let store = store.clone();
        let queue_cfg = config.queue.clone();
        join.spawn(async move {
            if !is_valid_address(&entry.address) {
                let err = Error::InvalidAddress {
                    address: entry.address.clone(),
                };
                return (entry, Err(err));
            }
            let overrides = entry.has_blue_check.map(|blue| EnqueueOverrides {
                has_blue_check: Some(blue),
                ..EnqueueOverrides::default()
            });
            let result = enqueue_collection(
                &*store,
                &entry.chain_id,
                &entry.address,
                None,
                overrides,
                &queue_cfg,
            )
            .await;
            (entry, result)
        });
    }

    // All-settled semantics: every entry is attempted, failures only logged.
    let mut failures = 0usize;
    while let Some(result) = join.join_next().await {
        match result {
            Ok((entry, Ok(outcome))) => {
                info!("{}:{} -> {:?}", entry.chain_id, entry.address, outcome);
            }
            Ok((entry, Err(e))) => {
                failures += 1;
                error!("{}:{} failed: {}", entry.chain_id, entry.address, e);
            }
            Err(e) => {
                failures += 1;
                error!("enqueue task panicked: {}", e);
            }
        }
    }

    if failures > 0 {
        warn!("{} enqueue(s) failed", failures);
    }
    Ok(())
}
