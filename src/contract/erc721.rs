//! ERC-721 contract adapter
//!
//! Decodes transfers and ownership events from raw topics, and resolves
//! owner/tokenURI through `eth_call` with manual ABI encoding. Whether the
//! contract supports the base-URI scheme is cached after the first attempt.

use crate::contract::{decode_error, ContractAdapter, TransferEvent};
use crate::error::{Error, Result};
use crate::model::TokenStandard;
use crate::paginator::{LogPaginator, PaginateConfig, RangeQuery, ToBlock};
use crate::provider::{is_call_revert, with_retry, ProviderHandle};
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token as AbiToken};
use ethers::types::{Address, Bytes, Filter, Log, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// `Transfer(address,address,uint256)`
pub static TRANSFER_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("Transfer(address,address,uint256)")));

/// `OwnershipTransferred(address,address)`
pub static OWNERSHIP_TRANSFERRED_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("OwnershipTransferred(address,address)")));

const OWNER_ATTEMPTS: u32 = 3;

pub struct Erc721Adapter {
    chain_id: String,
    address: Address,
    client: ProviderHandle,
    paginate: PaginateConfig,
    /// `Some(base)` once baseURI() has succeeded, `None` once it has failed;
    /// unset until first use.
    base_uri: OnceCell<Option<String>>,
}

impl Erc721Adapter {
    pub fn new(
        chain_id: &str,
        address: Address,
        client: ProviderHandle,
        paginate: PaginateConfig,
    ) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            address,
            client,
            paginate,
            base_uri: OnceCell::new(),
        }
    }

    async fn call_string(&self, signature: &str, args: &[AbiToken]) -> Result<String> {
        let mut data = ethers::utils::id(signature).to_vec();
        data.extend(abi::encode(args));
        let out = self.client.call(self.address, Bytes::from(data)).await?;
        let mut tokens = abi::decode(&[ParamType::String], &out).map_err(|e| {
            Error::ContractCall {
                contract: format!("{:?}", self.address).into(),
                message: format!("{} returned undecodable data: {}", signature, e).into(),
            }
        })?;
        match tokens.pop() {
            Some(AbiToken::String(s)) => Ok(s),
            _ => Err(Error::ContractCall {
                contract: format!("{:?}", self.address).into(),
                message: format!("{} returned no string", signature).into(),
            }),
        }
    }

    async fn resolve_base_uri(&self) -> Option<String> {
        match self.call_string("baseURI()", &[]).await {
            Ok(base) if !base.is_empty() => Some(base),
            _ => None,
        }
    }
}

#[async_trait]
impl ContractAdapter for Erc721Adapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn address(&self) -> Address {
        self.address
    }

    fn standard(&self) -> TokenStandard {
        TokenStandard::Erc721
    }

    fn mint_filter(&self) -> Filter {
        Filter::new()
            .address(self.address)
            .topic0(*TRANSFER_TOPIC)
            .topic1(H256::zero())
    }

    fn mint_query(&self) -> RangeQuery {
        let client = self.client.clone();
        let filter = self.mint_filter();
        Arc::new(move |from, to| {
            let client = client.clone();
            let filter = filter.clone().from_block(from).to_block(to);
            Box::pin(async move { client.get_logs(&filter).await })
        })
    }

    fn decode_deployer(&self, event: &Log) -> Result<Address> {
        if event.topics.len() < 3 {
            return Err(decode_error(
                "OwnershipTransferred",
                "missing new owner topic",
            ));
        }
        Ok(Address::from_slice(&event.topics[2].as_bytes()[12..]))
    }

    fn decode_transfer(&self, event: &Log) -> Result<TransferEvent> {
        if event.topics.len() < 2 {
            return Err(decode_error("Transfer", "missing from topic"));
        }
        if event.topics.len() < 3 {
            return Err(decode_error("Transfer", "missing to topic"));
        }
        if event.topics.len() < 4 {
            return Err(decode_error("Transfer", "missing token id topic"));
        }
        Ok(TransferEvent {
            from: Address::from_slice(&event.topics[1].as_bytes()[12..]),
            to: Address::from_slice(&event.topics[2].as_bytes()[12..]),
            token_id: U256::from_big_endian(event.topics[3].as_bytes()),
        })
    }

    async fn creation_event(&self) -> Result<Log> {
        let filter = Filter::new()
            .address(self.address)
            .topic0(*OWNERSHIP_TRANSFERRED_TOPIC)
            .topic1(H256::zero());
        let client = self.client.clone();
        let query: RangeQuery = Arc::new(move |from, to| {
            let client = client.clone();
            let filter = filter.clone().from_block(from).to_block(to);
            Box::pin(async move { client.get_logs(&filter).await })
        });

        let paginator = LogPaginator::new(self.client.clone(), self.paginate.clone());
        let mut events = paginator.collect(query, 0, ToBlock::Latest).await?;
        events.sort_by_key(|e| {
            (
                e.block_number.map(|b| b.as_u64()).unwrap_or(u64::MAX),
                e.log_index.map(|i| i.as_u64()).unwrap_or(u64::MAX),
            )
        });
        events
            .into_iter()
            .next()
            .ok_or_else(|| Error::CreationEventNotFound {
                address: format!("{:?}", self.address),
            })
    }

    async fn owner(&self) -> Result<String> {
        let result = with_retry(
            || async {
                let data = Bytes::from(ethers::utils::id("owner()").to_vec());
                let out = self.client.call(self.address, data).await?;
                let mut tokens =
                    abi::decode(&[ParamType::Address], &out).map_err(|e| Error::ContractCall {
                        contract: format!("{:?}", self.address).into(),
                        message: format!("owner() returned undecodable data: {}", e).into(),
                    })?;
                match tokens.pop() {
                    Some(AbiToken::Address(addr)) => Ok(format!("{:?}", addr)),
                    _ => Err(Error::ContractCall {
                        contract: format!("{:?}", self.address).into(),
                        message: "owner() returned no address".into(),
                    }),
                }
            },
            OWNER_ATTEMPTS,
            Duration::from_millis(500),
            "owner",
        )
        .await;

        match result {
            Ok(owner) => Ok(owner),
            // No owner concept on this contract; the caller substitutes the
            // deployer.
            Err(e) if is_call_revert(&e) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    async fn token_uri(&self, token_id: &str) -> Result<String> {
        let id = U256::from_dec_str(token_id).map_err(|_| Error::UriUnavailable {
            token_id: token_id.to_string(),
        })?;

        let base = self
            .base_uri
            .get_or_init(|| self.resolve_base_uri())
            .await;
        if let Some(base) = base {
            return Ok(format!("{}{}", base, token_id));
        }

        match self
            .call_string("tokenURI(uint256)", &[AbiToken::Uint(id)])
            .await
        {
            Ok(uri) if !uri.is_empty() => Ok(uri),
            _ => Err(Error::UriUnavailable {
                token_id: token_id.to_string(),
            }),
        }
    }
}
