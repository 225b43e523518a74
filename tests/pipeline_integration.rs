//! End-to-end pipeline tests
//!
//! A fake chain with three mints is driven through the full collection
//! pipeline against the in-memory store: claim, deployer resolution, mint
//! collection, token metadata/images, aggregation, completion.

use async_trait::async_trait;
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, FilterBlockOption, Log, Transaction, TransactionReceipt,
    ValueOrArray, H256, U256,
};
use mintstream::config::{FetchConfig, PipelineConfig, QueueConfig};
use mintstream::contract::erc721::{OWNERSHIP_TRANSFERRED_TOPIC, TRANSFER_TOPIC};
use mintstream::error::{Error, Result};
use mintstream::fetch::{CollectionStatsProvider, FsBlobStore, MetadataFetcher};
use mintstream::model::{
    collection_path, token_path, Collection, CollectionMetadata, CreationStep, RefreshStep, Token,
};
use mintstream::pipeline::{trait_frequency_scorer, CollectionRunner, PipelineContext};
use mintstream::provider::{ChainClient, ProviderPool};
use mintstream::queue::{enqueue_collection, CollectionQueue, EnqueueOutcome};
use mintstream::store::memory::MemoryDocStore;
use mintstream::store::DocStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HEAD: u64 = 110;
const CREATION_BLOCK: u64 = 50;
const MINT_BLOCKS: [u64; 3] = [100, 101, 102];

fn deployer() -> Address {
    Address::repeat_byte(0x22)
}

fn contract_address() -> Address {
    Address::repeat_byte(0xab)
}

fn minter() -> Address {
    Address::repeat_byte(0x11)
}

fn address_topic(addr: Address) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(addr.as_bytes());
    H256::from(bytes)
}

fn id_topic(token_id: u64) -> H256 {
    let mut bytes = [0u8; 32];
    U256::from(token_id).to_big_endian(&mut bytes);
    H256::from(bytes)
}

fn filter_topic0(filter: &Filter) -> Option<H256> {
    match &filter.topics[0] {
        Some(ValueOrArray::Value(Some(topic))) => Some(*topic),
        _ => None,
    }
}

fn filter_range(filter: &Filter) -> (u64, u64) {
    match filter.block_option {
        FilterBlockOption::Range {
            from_block,
            to_block,
        } => {
            let from = match from_block {
                Some(BlockNumber::Number(n)) => n.as_u64(),
                _ => 0,
            };
            let to = match to_block {
                Some(BlockNumber::Number(n)) => n.as_u64(),
                _ => u64::MAX,
            };
            (from, to)
        }
        _ => (0, u64::MAX),
    }
}

/// A chain holding one ERC-721 contract deployed at block 50 with three
/// mints at blocks 100..=102, one ETH paid per mint transaction.
struct FakeChain {
    metadata_base: String,
}

impl FakeChain {
    fn creation_event(&self) -> Log {
        Log {
            address: contract_address(),
            topics: vec![
                *OWNERSHIP_TRANSFERRED_TOPIC,
                H256::zero(),
                address_topic(deployer()),
            ],
            block_number: Some(CREATION_BLOCK.into()),
            ..Default::default()
        }
    }

    fn mint_event(&self, token_id: u64, block: u64) -> Log {
        Log {
            address: contract_address(),
            topics: vec![
                *TRANSFER_TOPIC,
                H256::zero(),
                address_topic(minter()),
                id_topic(token_id),
            ],
            block_number: Some(block.into()),
            transaction_hash: Some(H256::from_low_u64_be(block)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_block_number(&self) -> Result<u64> {
        Ok(HEAD)
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<Option<u64>> {
        Ok(Some(1_600_000_000 + number))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        let (from, to) = filter_range(filter);
        let topic0 = filter_topic0(filter);

        if topic0 == Some(*OWNERSHIP_TRANSFERRED_TOPIC) {
            if (from..=to).contains(&CREATION_BLOCK) {
                return Ok(vec![self.creation_event()]);
            }
            return Ok(vec![]);
        }
        if topic0 == Some(*TRANSFER_TOPIC) {
            return Ok(MINT_BLOCKS
                .iter()
                .enumerate()
                .filter(|(_, block)| (from..=to).contains(*block))
                .map(|(i, block)| self.mint_event(i as u64 + 1, *block))
                .collect());
        }
        Ok(vec![])
    }

    async fn get_transaction(&self, _hash: H256) -> Result<Option<Transaction>> {
        Ok(Some(Transaction {
            value: ethers::utils::parse_ether(1u64).unwrap(),
            ..Default::default()
        }))
    }

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        // One matching transfer per mint transaction.
        let block = hash.to_low_u64_be();
        Ok(Some(TransactionReceipt {
            logs: vec![self.mint_event(1, block)],
            ..Default::default()
        }))
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes> {
        if data[..4] == ethers::utils::id("baseURI()")[..] {
            return Ok(Bytes::from(ethers::abi::encode(&[
                ethers::abi::Token::String(self.metadata_base.clone()),
            ])));
        }
        // No owner concept: the pipeline falls back to the deployer.
        Err(Error::blockchain("execution reverted"))
    }
}

struct StubStats;

#[async_trait]
impl CollectionStatsProvider for StubStats {
    async fn collection_metadata(
        &self,
        _chain_id: &str,
        _address: &str,
    ) -> Result<CollectionMetadata> {
        Ok(CollectionMetadata {
            name: "Test Collection".to_string(),
            symbol: "TEST".to_string(),
            ..Default::default()
        })
    }
}

async fn mount_token_endpoints(server: &MockServer) {
    for token_id in 1..=3u64 {
        Mock::given(method("GET"))
            .and(path(format!("/meta/{}", token_id)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "name": format!("Token #{}", token_id),
                    "image": format!("{}/img/{}.png", server.uri(), token_id),
                    "attributes": [
                        { "trait_type": "Background", "value": "Blue" },
                        { "trait_type": "Serial", "value": token_id.to_string() },
                    ]
                })),
            )
            .mount(server)
            .await;

        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(format!("image-{}", token_id).as_bytes());
        Mock::given(method("GET"))
            .and(path(format!("/img/{}.png", token_id)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(png)
                    .insert_header("content-type", "image/png"),
            )
            .mount(server)
            .await;
    }
}

struct Fixture {
    store: Arc<MemoryDocStore>,
    runner: Arc<CollectionRunner>,
    address: String,
    _server: MockServer,
    _blob_dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let server = MockServer::start().await;
    mount_token_endpoints(&server).await;

    let store = Arc::new(MemoryDocStore::new());
    let client: Arc<dyn ChainClient> = Arc::new(FakeChain {
        metadata_base: format!("{}/meta/", server.uri()),
    });
    let mut pools: BTreeMap<String, Vec<Arc<dyn ChainClient>>> = BTreeMap::new();
    pools.insert("1".to_string(), vec![client]);

    let blob_dir = tempfile::tempdir().unwrap();
    let fetch_cfg = FetchConfig {
        timeout: Duration::from_secs(2),
        ipfs_gateway: "https://ipfs.example/ipfs/".to_string(),
        max_attempts: 3,
        retry_delay: Duration::from_millis(1),
        stats_api_url: String::new(),
        blob_dir: String::new(),
        blob_base_url: String::new(),
    };

    let runner = Arc::new(CollectionRunner::new(Arc::new(PipelineContext {
        store: store.clone(),
        providers: Arc::new(ProviderPool::from_handles(pools)),
        fetcher: Arc::new(MetadataFetcher::new(&fetch_cfg).unwrap()),
        blob: Arc::new(FsBlobStore::new(blob_dir.path(), "http://localhost/blobs")),
        stats: Arc::new(StubStats),
        scorer: trait_frequency_scorer(),
        pipeline: PipelineConfig {
            page_size: 2000,
            uncle_safety_margin: 6,
            paginate_attempts: 5,
            paginate_retry_delay: Duration::from_millis(1),
            token_concurrency: 8,
            mint_gate: 16,
            chunk_concurrency: 8,
            lookup_attempts: 3,
        },
    })));

    Fixture {
        store,
        runner,
        address: format!("{:?}", contract_address()),
        _server: server,
        _blob_dir: blob_dir,
    }
}

fn queue_cfg() -> QueueConfig {
    QueueConfig {
        workers: 1,
        max_run_attempts: 3,
        claim_liveness: Duration::from_secs(7200),
        progress_grace: Duration::from_secs(60),
        claim_stale: Duration::from_secs(10800),
        monitor_interval: Duration::from_secs(300),
    }
}

#[tokio::test]
async fn test_full_pipeline_reaches_complete() {
    let fx = fixture().await;
    let path = collection_path("1", &fx.address);

    let outcome = enqueue_collection(&*fx.store, "1", &fx.address, None, None, &queue_cfg())
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Enqueued);
    assert!(fx.store.try_claim(&path, 1).await.unwrap());

    fx.runner.run("1", &fx.address).await.unwrap();

    let doc = fx.store.get(&path).await.unwrap().unwrap();
    let collection: Collection = serde_json::from_value(doc).unwrap();
    assert_eq!(collection.state.create.step, CreationStep::Complete);
    assert!(collection.state.create.error.is_none());
    assert_eq!(collection.num_nfts, 3);
    assert_eq!(collection.deployer, format!("{:?}", deployer()));
    // owner() reverted, so the owner fell back to the deployer.
    assert_eq!(collection.owner, collection.deployer);
    assert_eq!(collection.metadata.name, "Test Collection");
    assert_eq!(collection.deployed_at_block, CREATION_BLOCK);
    // Trait aggregation saw the complete set.
    assert_eq!(collection.attributes["Background"]["Blue"], 3);
    assert_eq!(collection.attributes["Serial"].len(), 3);

    let mut ranks = Vec::new();
    for (i, block) in MINT_BLOCKS.iter().enumerate() {
        let token_id = (i + 1).to_string();
        let doc = fx
            .store
            .get(&token_path("1", &fx.address, &token_id))
            .await
            .unwrap()
            .expect("token document");
        let token: Token = serde_json::from_value(doc).unwrap();

        assert_eq!(token.state.metadata.step, RefreshStep::Complete);
        assert!(token.state.metadata.error.is_none());
        assert_eq!(token.minted_at, (1_600_000_000 + block) * 1000);
        assert_eq!(token.mint_price, 1.0);
        assert_eq!(token.minter, format!("{:?}", minter()));
        assert_eq!(token.num_trait_types, 2);
        assert!(token.image.url.contains("/blobs/images/1/collections/"));
        assert!(token.image.original_url.ends_with(&format!("{}.png", token_id)));
        ranks.push(token.rarity_rank);
    }
    ranks.sort_unstable();
    assert_eq!(ranks, vec![1, 2, 3]);

    // Attribute sub-documents were written for the large-trait-set layout.
    let attr = fx
        .store
        .get(&format!("{}/attributes/Background", path))
        .await
        .unwrap()
        .expect("attribute document");
    assert_eq!(
        attr.pointer("/values/Blue").and_then(serde_json::Value::as_u64),
        Some(3)
    );

    // A second run over a Complete collection is a no-op.
    fx.runner.run("1", &fx.address).await.unwrap();
}

#[tokio::test]
async fn test_claim_exclusivity_under_contention() {
    let fx = fixture().await;
    let path = collection_path("1", &fx.address);
    enqueue_collection(&*fx.store, "1", &fx.address, None, None, &queue_cfg())
        .await
        .unwrap();

    let mut join = tokio::task::JoinSet::new();
    for worker in 0..16u64 {
        let store = fx.store.clone();
        let path = path.clone();
        join.spawn(async move { store.try_claim(&path, 1000 + worker).await.unwrap() });
    }

    let mut winners = 0;
    while let Some(result) = join.join_next().await {
        if result.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_queue_claims_and_completes_collections() {
    let fx = fixture().await;
    let path = collection_path("1", &fx.address);

    let queue = CollectionQueue::new(fx.store.clone(), fx.runner.clone(), queue_cfg());
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let worker = tokio::spawn(queue.run(shutdown_tx.subscribe()));

    enqueue_collection(&*fx.store, "1", &fx.address, None, None, &queue_cfg())
        .await
        .unwrap();

    // Wait for the queue to claim, run, and complete the collection.
    let mut completed = false;
    for _ in 0..200 {
        if let Some(doc) = fx.store.get(&path).await.unwrap() {
            if doc.pointer("/state/create/step") == Some(&serde_json::json!("complete")) {
                completed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(completed, "queue never completed the collection");

    let _ = shutdown_tx.send(());
    let _ = worker.await;
}
