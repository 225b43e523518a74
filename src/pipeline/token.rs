//! Per-token state machine
//!
//! A resumable pipeline keyed by the token's persisted step:
//! Uri -> Metadata -> Image -> Aggregate -> Complete. Each step is idempotent
//! given the same input, advances on success, and never skips. The Aggregate
//! step suspends: the caller computes rarity collection-wide and injects it
//! through [`TokenMachine::resume`].
//!
//! The machine performs no document-store I/O; every transition leaves a
//! snapshot in [`TokenMachine::token`] for the caller to persist.

use crate::contract::ContractAdapter;
use crate::error::{Error, Result};
use crate::fetch::{image_path, BlobStore, MetadataFetcher};
use crate::model::{now_ms, RefreshStep, StoredError, Token};
use crate::pipeline::rarity::RarityInjection;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Everything a token step may need.
pub struct TokenStepContext {
    pub chain_id: String,
    pub collection_address: String,
    pub adapter: Arc<dyn ContractAdapter>,
    pub fetcher: Arc<MetadataFetcher>,
    pub blob: Arc<dyn BlobStore>,
}

/// Result of driving the machine one step.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOutcome {
    /// Step succeeded; call `advance` again.
    Advanced,
    /// Waiting at Aggregate for injected rarity data.
    Suspended,
    /// Terminal.
    Complete,
    /// This run is over for the token; the error is also in the snapshot.
    Failed(StoredError),
}

pub struct TokenMachine {
    token: Token,
}

impl TokenMachine {
    /// Wrap a token at its persisted step. `reset` forces a restart at Uri
    /// regardless of the stored step (forced re-indexing).
    pub fn new(mut token: Token, reset: bool) -> Self {
        if reset {
            token.state.metadata.step = RefreshStep::Uri;
            token.state.metadata.error = None;
        }
        Self { token }
    }

    /// Current snapshot, including step and error state.
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn into_token(self) -> Token {
        self.token
    }

    pub fn step(&self) -> RefreshStep {
        self.token.state.metadata.step
    }

    /// Run the current step. Advances the persisted step on success.
    pub async fn advance(&mut self, ctx: &TokenStepContext) -> TokenOutcome {
        let result = match self.token.state.metadata.step {
            RefreshStep::Mint => {
                // Mint data is already in place; the pipeline proper starts
                // at Uri.
                self.token.state.metadata.step = RefreshStep::Uri;
                Ok(())
            }
            RefreshStep::Uri => self.step_uri(ctx).await,
            RefreshStep::Metadata => self.step_metadata(ctx).await,
            RefreshStep::Image => self.step_image(ctx).await,
            RefreshStep::Aggregate => return TokenOutcome::Suspended,
            RefreshStep::Complete => return TokenOutcome::Complete,
        };

        match result {
            Ok(()) => {
                self.token.state.metadata.error = None;
                TokenOutcome::Advanced
            }
            Err(e) => self.fail(e),
        }
    }

    /// Inject collection-wide rarity into the suspended Aggregate step.
    pub fn resume(&mut self, injection: RarityInjection) -> TokenOutcome {
        if self.token.state.metadata.step != RefreshStep::Aggregate {
            return self.fail(Error::token_step(
                RefreshStep::Aggregate,
                "resume called outside the aggregate step",
            ));
        }
        match (injection.rarity_score, injection.rarity_rank) {
            (Some(score), Some(rank)) => {
                self.token.rarity_score = score;
                self.token.rarity_rank = rank;
                self.token.state.metadata.step = RefreshStep::Complete;
                self.token.state.metadata.error = None;
                TokenOutcome::Complete
            }
            _ => self.fail(Error::token_step(
                RefreshStep::Aggregate,
                "injected rarity is missing a numeric field",
            )),
        }
    }

    /// Record a failure. Recognized step errors keep the step they tagged;
    /// anything else resets to Uri, since the failure point isn't trusted.
    fn fail(&mut self, error: Error) -> TokenOutcome {
        let stored = match &error {
            Error::TokenStep { step, .. } => {
                self.token.state.metadata.step = *step;
                error.to_stored()
            }
            other => {
                let at = self.token.state.metadata.step;
                self.token.state.metadata.step = RefreshStep::Uri;
                StoredError::unknown(format!("{} (at step {})", other, at))
            }
        };
        self.token.state.metadata.error = Some(stored.clone());
        TokenOutcome::Failed(stored)
    }

    async fn step_uri(&mut self, ctx: &TokenStepContext) -> Result<()> {
        let uri = ctx
            .adapter
            .token_uri(&self.token.token_id)
            .await
            .map_err(|e| Error::token_step(RefreshStep::Uri, e.to_string()))?;
        self.token.token_uri = uri;
        self.token.state.metadata.step = RefreshStep::Metadata;
        Ok(())
    }

    async fn step_metadata(&mut self, ctx: &TokenStepContext) -> Result<()> {
        let metadata = ctx
            .fetcher
            .fetch_json(&self.token.token_uri)
            .await
            .map_err(|e| Error::token_step(RefreshStep::Metadata, e.to_string()))?;
        self.token.metadata = Some(metadata);
        self.token.num_trait_types = self
            .token
            .attributes()
            .into_iter()
            .map(|(trait_type, _)| trait_type)
            .collect::<BTreeSet<_>>()
            .len() as u32;
        self.token.state.metadata.step = RefreshStep::Image;
        Ok(())
    }

    async fn step_image(&mut self, ctx: &TokenStepContext) -> Result<()> {
        let original_url = self
            .token
            .metadata
            .as_ref()
            .and_then(|m| m.get("image").or_else(|| m.get("image_url")))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::token_step(RefreshStep::Image, "metadata has no image url"))?
            .to_string();

        let (bytes, content_type) = ctx
            .fetcher
            .fetch_bytes(&original_url)
            .await
            .map_err(|e| Error::token_step(RefreshStep::Image, e.to_string()))?;
        if bytes.is_empty() {
            return Err(Error::token_step(RefreshStep::Image, "empty image buffer"));
        }
        if content_type.is_empty() {
            return Err(Error::token_step(
                RefreshStep::Image,
                "image has no content type",
            ));
        }

        let path = image_path(&ctx.chain_id, &ctx.collection_address, &bytes);
        let url = ctx
            .blob
            .upload(&bytes, &path, &content_type)
            .await
            .map_err(|e| Error::token_step(RefreshStep::Image, e.to_string()))?;
        if url.is_empty() {
            return Err(Error::token_step(
                RefreshStep::Image,
                "upload produced no public url",
            ));
        }

        self.token.image = crate::model::TokenImage {
            url,
            original_url,
            updated_at: now_ms(),
        };
        self.token.state.metadata.step = RefreshStep::Aggregate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::contract::adapter_for;
    use crate::fetch::FsBlobStore;
    use crate::model::TokenStandard;
    use crate::paginator::PaginateConfig;
    use crate::provider::ChainClient;
    use async_trait::async_trait;
    use ethers::abi::{self, Token as AbiToken};
    use ethers::types::{Address, Bytes, Filter, Log, Transaction, TransactionReceipt, H256};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

    /// Chain whose baseURI points at the mock HTTP server.
    struct FakeChain {
        base_uri: String,
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn get_block_number(&self) -> crate::error::Result<u64> {
            Ok(100)
        }
        async fn get_block_timestamp(&self, _number: u64) -> crate::error::Result<Option<u64>> {
            Ok(None)
        }
        async fn get_logs(&self, _filter: &Filter) -> crate::error::Result<Vec<Log>> {
            Ok(vec![])
        }
        async fn get_transaction(&self, _hash: H256) -> crate::error::Result<Option<Transaction>> {
            Ok(None)
        }
        async fn get_transaction_receipt(
            &self,
            _hash: H256,
        ) -> crate::error::Result<Option<TransactionReceipt>> {
            Ok(None)
        }
        async fn call(&self, _to: Address, data: Bytes) -> crate::error::Result<Bytes> {
            if data[..4] == ethers::utils::id("baseURI()")[..] {
                return Ok(Bytes::from(abi::encode(&[AbiToken::String(
                    self.base_uri.clone(),
                )])));
            }
            Err(Error::blockchain("execution reverted"))
        }
    }

    fn fetcher() -> Arc<MetadataFetcher> {
        Arc::new(
            MetadataFetcher::new(&FetchConfig {
                timeout: Duration::from_secs(2),
                ipfs_gateway: "https://ipfs.example/ipfs/".to_string(),
                max_attempts: 3,
                retry_delay: Duration::from_millis(1),
                stats_api_url: String::new(),
                blob_dir: String::new(),
                blob_base_url: String::new(),
            })
            .unwrap(),
        )
    }

    async fn context(server: &MockServer, blob_root: &std::path::Path) -> TokenStepContext {
        let client = Arc::new(FakeChain {
            base_uri: format!("{}/meta/", server.uri()),
        });
        TokenStepContext {
            chain_id: "1".to_string(),
            collection_address: "0xabc".to_string(),
            adapter: adapter_for(
                TokenStandard::Erc721,
                "1",
                Address::repeat_byte(0xab),
                client,
                PaginateConfig::default(),
            ),
            fetcher: fetcher(),
            blob: Arc::new(FsBlobStore::new(blob_root, "http://localhost/blobs")),
        }
    }

    fn mount_metadata(server: &MockServer, image_url: &str) -> Mock {
        Mock::given(method("GET")).and(path("/meta/1")).respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Token #1",
                "image": image_url,
                "attributes": [
                    { "trait_type": "Background", "value": "Blue" },
                    { "trait_type": "Eyes", "value": "Laser" },
                ]
            })),
        )
    }

    fn mount_image() -> Mock {
        Mock::given(method("GET")).and(path("/img/1.png")).respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"\x89PNG\r\n\x1a\nfake image".to_vec())
                .insert_header("content-type", "image/png"),
        )
    }

    #[tokio::test]
    async fn test_steps_advance_in_order_and_suspend_at_aggregate() {
        let server = MockServer::start().await;
        mount_metadata(&server, &format!("{}/img/1.png", server.uri()))
            .mount(&server)
            .await;
        mount_image().mount(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;

        let token = Token::minted("1".into(), "0x11".into(), 1000, "0xtx".into(), 1.0);
        let mut machine = TokenMachine::new(token, false);

        let mut seen = vec![machine.step().index()];
        loop {
            match machine.advance(&ctx).await {
                TokenOutcome::Advanced => seen.push(machine.step().index()),
                TokenOutcome::Suspended => break,
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        // Step index never decreases across successful transitions.
        for pair in seen.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(machine.step(), RefreshStep::Aggregate);
        assert_eq!(machine.token().num_trait_types, 2);
        assert!(machine.token().image.url.contains("/blobs/images/1/collections/0xabc/"));
        assert!(machine.token().state.metadata.error.is_none());

        // Resume completes the machine.
        let outcome = machine.resume(RarityInjection {
            rarity_score: Some(7.5),
            rarity_rank: Some(1),
        });
        assert_eq!(outcome, TokenOutcome::Complete);
        assert_eq!(machine.step(), RefreshStep::Complete);
        assert_eq!(machine.token().rarity_rank, 1);
    }

    /// Metadata endpoint that fails twice before succeeding.
    struct FlakyMetadata {
        calls: std::sync::atomic::AtomicU32,
    }

    impl Respond for FlakyMetadata {
        fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 2 {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "name": "Token #1",
                    "attributes": [{ "trait_type": "Background", "value": "Blue" }]
                }))
            }
        }
    }

    #[tokio::test]
    async fn test_metadata_succeeds_on_third_attempt_without_persisted_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta/1"))
            .respond_with(FlakyMetadata {
                calls: std::sync::atomic::AtomicU32::new(0),
            })
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;

        let mut token = Token::minted("1".into(), "0x11".into(), 0, "0xtx".into(), 0.0);
        token.token_uri = format!("{}/meta/1", server.uri());
        token.state.metadata.step = RefreshStep::Metadata;
        let mut machine = TokenMachine::new(token, false);

        assert_eq!(machine.advance(&ctx).await, TokenOutcome::Advanced);
        assert_eq!(machine.step(), RefreshStep::Image);
        assert_eq!(machine.token().num_trait_types, 1);
        assert!(machine.token().state.metadata.error.is_none());
    }

    #[tokio::test]
    async fn test_step_error_keeps_its_step() {
        let server = MockServer::start().await;
        // Metadata without any image url makes the Image step fail.
        mount_metadata(&server, "").mount(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&server, dir.path()).await;

        let mut token = Token::minted("1".into(), "0x11".into(), 0, "0xtx".into(), 0.0);
        token.token_uri = format!("{}/meta/1", server.uri());
        token.metadata = Some(serde_json::json!({ "name": "no image" }));
        token.state.metadata.step = RefreshStep::Image;
        let mut machine = TokenMachine::new(token, false);

        match machine.advance(&ctx).await {
            TokenOutcome::Failed(stored) => {
                assert_eq!(stored.discriminator, "image");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(machine.step(), RefreshStep::Image);
    }

    #[test]
    fn test_unknown_error_resets_to_uri() {
        let token = {
            let mut t = Token::minted("1".into(), "0x11".into(), 0, "0xtx".into(), 0.0);
            t.state.metadata.step = RefreshStep::Image;
            t
        };
        let mut machine = TokenMachine::new(token, false);

        let outcome = machine.fail(Error::blockchain("socket dropped"));
        match outcome {
            TokenOutcome::Failed(stored) => {
                assert!(stored.is_unknown());
                assert!(stored.message.contains("image"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(machine.step(), RefreshStep::Uri);
    }

    #[test]
    fn test_reset_flag_forces_uri() {
        let mut token = Token::minted("1".into(), "0x11".into(), 0, "0xtx".into(), 0.0);
        token.state.metadata.step = RefreshStep::Aggregate;
        let machine = TokenMachine::new(token, true);
        assert_eq!(machine.step(), RefreshStep::Uri);
    }

    #[test]
    fn test_resume_requires_both_numeric_fields() {
        let mut token = Token::minted("1".into(), "0x11".into(), 0, "0xtx".into(), 0.0);
        token.state.metadata.step = RefreshStep::Aggregate;
        let mut machine = TokenMachine::new(token, false);

        match machine.resume(RarityInjection {
            rarity_score: Some(1.0),
            rarity_rank: None,
        }) {
            TokenOutcome::Failed(stored) => assert_eq!(stored.discriminator, "aggregate"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
