//! Contract adapters
//!
//! Standard-specific decode/encode logic layered over the log paginator. The
//! adapter surface is a capability set selected by a factory keyed on token
//! standard; ERC-721 is the one concrete variant today.

pub mod erc721;

use crate::error::{Error, Result};
use crate::model::{Token, TokenStandard};
use crate::paginator::{PaginateConfig, RangeQuery};
use crate::provider::ProviderHandle;
use async_trait::async_trait;
use ethers::types::{Address, Filter, Log};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A decoded transfer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub token_id: ethers::types::U256,
}

/// Standard-specific contract operations.
#[async_trait]
pub trait ContractAdapter: Send + Sync {
    fn chain_id(&self) -> &str;

    fn address(&self) -> Address;

    fn standard(&self) -> TokenStandard;

    /// Filter matching mint transfers (`from == null address`).
    fn mint_filter(&self) -> Filter;

    /// Range-query thunk over the mint filter, for the paginator.
    fn mint_query(&self) -> RangeQuery;

    /// Deployer address from the contract creation event.
    fn decode_deployer(&self, event: &Log) -> Result<Address>;

    /// Decode a transfer event; fails with a decode error if any of the
    /// from/to/tokenId fields is absent.
    fn decode_transfer(&self, event: &Log) -> Result<TransferEvent>;

    /// The first "ownership transferred from the null address" event.
    async fn creation_event(&self) -> Result<Log>;

    /// Current contract owner, or an empty string when the contract has no
    /// owner concept (detected via a reverted call).
    async fn owner(&self) -> Result<String>;

    /// Token URI for a token id, trying a base-URI-plus-id scheme before the
    /// per-token call.
    async fn token_uri(&self, token_id: &str) -> Result<String>;
}

/// Select the concrete adapter for a token standard.
pub fn adapter_for(
    standard: TokenStandard,
    chain_id: &str,
    address: Address,
    client: ProviderHandle,
    paginate: PaginateConfig,
) -> Arc<dyn ContractAdapter> {
    match standard {
        TokenStandard::Erc721 => Arc::new(erc721::Erc721Adapter::new(
            chain_id, address, client, paginate,
        )),
    }
}

/// Count how many tokens share each (trait type, value) pair. The trait type
/// defaults to the value itself when absent. Accumulation is commutative, so
/// the result is independent of token order.
pub fn aggregate_traits(tokens: &[Token]) -> BTreeMap<String, BTreeMap<String, u64>> {
    let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for token in tokens {
        for (trait_type, value) in token.attributes() {
            *counts
                .entry(trait_type)
                .or_default()
                .entry(value)
                .or_default() += 1;
        }
    }
    counts
}

/// Error for a transfer log missing a required field.
pub(crate) fn decode_error(event: &'static str, message: &'static str) -> Error {
    Error::EventDecode {
        event,
        message: message.into(),
    }
}
