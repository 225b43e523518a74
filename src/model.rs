//! Core document model: collections, tokens, and their persisted pipeline state.
//!
//! Documents live in the store under logical paths:
//! - `collections/{chainId}:{address}` - the collection document
//! - `collections/{chainId}:{address}/nfts/{tokenId}` - per-token documents
//! - `collections/{chainId}:{address}/attributes/{traitType}` - per-trait counts
//!
//! Collection keys are always `${chainId}:${lowercaseAddress}`; token documents
//! are keyed by the bare token id string.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted document schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Lowercase an address for use in document keys.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// `true` if the string is a well-formed `0x`-prefixed 20-byte hex address.
pub fn is_valid_address(address: &str) -> bool {
    let addr = address.trim();
    addr.len() == 42
        && addr.starts_with("0x")
        && addr[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Document path for a collection.
pub fn collection_path(chain_id: &str, address: &str) -> String {
    format!("collections/{}:{}", chain_id, normalize_address(address))
}

/// Document path for a token within a collection.
pub fn token_path(chain_id: &str, address: &str, token_id: &str) -> String {
    format!("{}/nfts/{}", collection_path(chain_id, address), token_id)
}

/// Document path for a per-trait attribute document.
pub fn attribute_path(chain_id: &str, address: &str, trait_type: &str) -> String {
    format!("{}/attributes/{}", collection_path(chain_id, address), trait_type)
}

// ============================================================================
// Pipeline steps
// ============================================================================

/// Collection-creation pipeline step, ordered with the terminal step last.
///
/// `Unknown` is the state a document lands in when its persisted step string
/// is empty or unrecognized; it is distinct from every named step and marks
/// the collection as a candidate for full restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationStep {
    #[serde(rename = "collection-creator")]
    CollectionCreator,
    #[serde(rename = "collection-metadata")]
    CollectionMetadata,
    #[serde(rename = "collection-mints")]
    CollectionMints,
    #[serde(rename = "token-metadata")]
    TokenMetadata,
    #[serde(rename = "aggregate-metadata")]
    AggregateMetadata,
    #[serde(rename = "complete")]
    Complete,
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl CreationStep {
    /// Position in the pipeline. `Unknown` has no position.
    pub fn index(&self) -> Option<u8> {
        match self {
            CreationStep::CollectionCreator => Some(0),
            CreationStep::CollectionMetadata => Some(1),
            CreationStep::CollectionMints => Some(2),
            CreationStep::TokenMetadata => Some(3),
            CreationStep::AggregateMetadata => Some(4),
            CreationStep::Complete => Some(5),
            CreationStep::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CreationStep::CollectionCreator => "collection-creator",
            CreationStep::CollectionMetadata => "collection-metadata",
            CreationStep::CollectionMints => "collection-mints",
            CreationStep::TokenMetadata => "token-metadata",
            CreationStep::AggregateMetadata => "aggregate-metadata",
            CreationStep::Complete => "complete",
            CreationStep::Unknown => "unknown",
        }
    }

    /// `true` once the collection has moved past the first step.
    pub fn has_advanced(&self) -> bool {
        matches!(self.index(), Some(i) if i > 0)
    }
}

impl std::fmt::Display for CreationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-token refresh pipeline step, ordered with the terminal step last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshStep {
    #[serde(rename = "mint")]
    Mint,
    #[serde(rename = "uri")]
    Uri,
    #[serde(rename = "metadata")]
    Metadata,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "aggregate")]
    Aggregate,
    #[serde(rename = "complete")]
    Complete,
}

impl RefreshStep {
    pub fn index(&self) -> u8 {
        match self {
            RefreshStep::Mint => 0,
            RefreshStep::Uri => 1,
            RefreshStep::Metadata => 2,
            RefreshStep::Image => 3,
            RefreshStep::Aggregate => 4,
            RefreshStep::Complete => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStep::Mint => "mint",
            RefreshStep::Uri => "uri",
            RefreshStep::Metadata => "metadata",
            RefreshStep::Image => "image",
            RefreshStep::Aggregate => "aggregate",
            RefreshStep::Complete => "complete",
        }
    }
}

impl std::fmt::Display for RefreshStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported token standards. Selection happens through the adapter factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TokenStandard {
    #[serde(rename = "ERC721")]
    #[default]
    Erc721,
}

// ============================================================================
// Persisted error
// ============================================================================

/// An error persisted into `state.*.error`, tagged with the pipeline step
/// that produced it. The reserved discriminator `"unknown"` marks failures
/// whose step is not trusted; those entities restart from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredError {
    pub discriminator: String,
    pub message: String,
}

impl StoredError {
    pub fn new(discriminator: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            discriminator: discriminator.into(),
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new("unknown", message)
    }

    pub fn is_unknown(&self) -> bool {
        self.discriminator == "unknown"
    }
}

// ============================================================================
// Collection
// ============================================================================

/// Collection-level display metadata from the external stats provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub profile_image: String,
    #[serde(default)]
    pub banner_image: String,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateState {
    pub step: CreationStep,
    pub updated_at: u64,
    #[serde(default)]
    pub progress: f64,
    /// Resume cursor for the mint pagination; the next attempt picks up here
    /// instead of the contract's creation block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint_cursor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StoredError>,
}

impl Default for CreateState {
    fn default() -> Self {
        Self {
            step: CreationStep::CollectionCreator,
            updated_at: now_ms(),
            progress: 0.0,
            mint_cursor: None,
            error: None,
        }
    }
}

/// `claimed_at == 0` means unclaimed. Both fields are epoch-ms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    #[serde(default)]
    pub enqueued_at: u64,
    #[serde(default)]
    pub claimed_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportState {
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionState {
    pub create: CreateState,
    #[serde(default)]
    pub queue: QueueState,
    #[serde(default)]
    pub export: ExportState,
    pub version: u32,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self {
            create: CreateState::default(),
            queue: QueueState::default(),
            export: ExportState::default(),
            version: SCHEMA_VERSION,
        }
    }
}

/// One collection per chain + contract address.
///
/// Immutable except via the worker holding a valid claim, or via the queue's
/// claim transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub chain_id: String,
    /// Normalized lowercase contract address.
    pub address: String,
    #[serde(default)]
    pub deployer: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub deployed_at_block: u64,
    #[serde(default)]
    pub token_standard: TokenStandard,
    #[serde(default)]
    pub metadata: CollectionMetadata,
    #[serde(default)]
    pub num_nfts: u64,
    /// Trait aggregates: trait type -> value -> count. Large trait sets are
    /// additionally mirrored into per-trait attribute documents.
    #[serde(default)]
    pub attributes: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub has_blue_check: bool,
    #[serde(default)]
    pub index_initiator: String,
    #[serde(default)]
    pub state: CollectionState,
}

impl Collection {
    pub fn new(chain_id: &str, address: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            address: normalize_address(address),
            deployer: String::new(),
            owner: String::new(),
            deployed_at_block: 0,
            token_standard: TokenStandard::Erc721,
            metadata: CollectionMetadata::default(),
            num_nfts: 0,
            attributes: BTreeMap::new(),
            has_blue_check: false,
            index_initiator: String::new(),
            state: CollectionState::default(),
        }
    }

    pub fn path(&self) -> String {
        collection_path(&self.chain_id, &self.address)
    }
}

// ============================================================================
// Token
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenImage {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadataState {
    pub step: RefreshStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StoredError>,
}

impl Default for TokenMetadataState {
    fn default() -> Self {
        Self {
            step: RefreshStep::Mint,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenState {
    #[serde(default)]
    pub metadata: TokenMetadataState,
}

/// One token per collection per token id.
///
/// Created at the Mint step with minimal fields, mutated in place as it
/// advances, immutable once the step is Complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token_id: String,
    #[serde(default)]
    pub minter: String,
    #[serde(default)]
    pub minted_at: u64,
    #[serde(default)]
    pub mint_tx_hash: String,
    #[serde(default)]
    pub mint_price: f64,
    #[serde(default)]
    pub token_uri: String,
    /// Raw metadata document as fetched from the token URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub num_trait_types: u32,
    #[serde(default)]
    pub image: TokenImage,
    #[serde(default)]
    pub rarity_score: f64,
    #[serde(default)]
    pub rarity_rank: u64,
    #[serde(default)]
    pub state: TokenState,
}

impl Token {
    /// A token as first seen from its mint event.
    pub fn minted(
        token_id: String,
        minter: String,
        minted_at: u64,
        mint_tx_hash: String,
        mint_price: f64,
    ) -> Self {
        Self {
            token_id,
            minter,
            minted_at,
            mint_tx_hash,
            mint_price,
            token_uri: String::new(),
            metadata: None,
            num_trait_types: 0,
            image: TokenImage::default(),
            rarity_score: 0.0,
            rarity_rank: 0,
            state: TokenState::default(),
        }
    }

    /// Decoded `(trait type, value)` pairs from the raw metadata blob. The
    /// trait type defaults to the value itself when absent.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let Some(meta) = &self.metadata else {
            return Vec::new();
        };
        let Some(attrs) = meta.get("attributes").and_then(|a| a.as_array()) else {
            return Vec::new();
        };
        attrs
            .iter()
            .filter_map(|attr| {
                let value = attr.get("value").map(json_value_to_string)?;
                let trait_type = attr
                    .get("trait_type")
                    .and_then(|t| t.as_str())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| value.clone());
                Some((trait_type, value))
            })
            .collect()
    }
}

/// Render a metadata attribute value as a flat string key.
fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Block range cursor
// ============================================================================

/// Mutable pagination state, narrowed adaptively. Owned exclusively by one
/// paginator invocation; never shared across concurrent calls.
#[derive(Debug, Clone)]
pub struct BlockCursor {
    pub min_block: u64,
    pub max_block: u64,
    pub from: u64,
    pub to: u64,
    pub page_size: u64,
}
