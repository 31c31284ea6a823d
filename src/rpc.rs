/// Node JSON-RPC adapters
///
/// Blocks and previous transactions are fetched as raw consensus bytes
/// (`getblock <hash> 0`, `getrawtransaction <txid> 0`) and decoded locally.
/// `getrawtransaction` for arbitrary txids requires a node running with
/// `-txindex`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ProviderError, SourceError};
use crate::metrics;
use crate::sync::BlockSource;
use crate::types::{CBlock, CTransaction};
use crate::utxo::{UtxoEntry, UtxoProvider};

/// `RPC_INVALID_ADDRESS_OR_KEY`: unknown transaction or block hash.
const RPC_NOT_FOUND: i64 = -5;
/// `RPC_INVALID_PARAMETER`: block height out of range.
const RPC_OUT_OF_RANGE: i64 = -8;

const SLOW_CALL_SECS: f64 = 5.0;

pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    user: String,
    pass: String,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.url)
            .field("user", &self.user)
            .finish()
    }
}

impl RpcClient {
    pub fn new(url: String, user: String, pass: String, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, user, pass })
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ProviderError> {
        let timer = metrics::Timer::new();
        let result = self.send(method, params).await;
        let elapsed = timer.elapsed_secs();
        metrics::record_rpc_call_duration(method, elapsed);

        if elapsed > SLOW_CALL_SECS {
            warn!(method, duration_secs = elapsed, "Slow RPC call");
        }
        if let Err(e) = &result {
            let kind = match e {
                ProviderError::Rpc { .. } => "rpc",
                ProviderError::Transport(_) => "transport",
                ProviderError::Decode(_) => "decode",
            };
            metrics::increment_rpc_errors(method, kind);
        }
        result
    }

    async fn send<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&json!({
                "jsonrpc": "1.0",
                "id": "balanceblox",
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let body: Value = response.json().await?;
        parse_response(body)
    }

    pub async fn get_block_count(&self) -> Result<u64, ProviderError> {
        self.call("getblockcount", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u32) -> Result<String, ProviderError> {
        self.call("getblockhash", json!([height])).await
    }

    pub async fn get_raw_block(&self, hash: &str) -> Result<String, ProviderError> {
        self.call("getblock", json!([hash, 0])).await
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> Result<String, ProviderError> {
        self.call("getrawtransaction", json!([txid, 0])).await
    }
}

fn parse_response<T: DeserializeOwned>(mut body: Value) -> Result<T, ProviderError> {
    match body.get("error") {
        Some(err) if !err.is_null() => {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ProviderError::Rpc { code, message });
        }
        _ => {}
    }

    let result = body
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| ProviderError::Decode("No result in RPC response".to_string()))?;
    serde_json::from_value(result).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn is_code(err: &ProviderError, expected: i64) -> bool {
    matches!(err, ProviderError::Rpc { code, .. } if *code == expected)
}

pub fn decode_block(height: u32, raw_hex: &str) -> Result<CBlock, SourceError> {
    let raw = hex::decode(raw_hex).map_err(|e| SourceError::Malformed {
        height,
        reason: format!("invalid hex: {}", e),
    })?;
    let block: bitcoin::Block = deserialize(&raw).map_err(|e| SourceError::Malformed {
        height,
        reason: e.to_string(),
    })?;
    CBlock::from_bitcoin(height, &block)
}

pub fn decode_transaction(raw_hex: &str) -> Result<CTransaction, ProviderError> {
    let raw = hex::decode(raw_hex).map_err(|e| ProviderError::Decode(format!("invalid hex: {}", e)))?;
    let tx: bitcoin::Transaction = deserialize(&raw).map_err(|e| ProviderError::Decode(e.to_string()))?;
    CTransaction::from_bitcoin(&tx).map_err(ProviderError::Decode)
}

pub struct RpcBlockSource {
    client: Arc<RpcClient>,
}

impl RpcBlockSource {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn tip_height(&self) -> Result<u32, SourceError> {
        let count = self.client.get_block_count().await?;
        u32::try_from(count).map_err(|_| SourceError::Malformed {
            height: u32::MAX,
            reason: format!("block count {} exceeds u32", count),
        })
    }

    async fn block_at(&self, height: u32) -> Result<Option<CBlock>, SourceError> {
        let hash = match self.client.get_block_hash(height).await {
            Ok(hash) => hash,
            Err(e) if is_code(&e, RPC_OUT_OF_RANGE) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = self.client.get_raw_block(&hash).await?;
        let block = decode_block(height, &raw)?;

        if block.hash != hash {
            return Err(SourceError::Malformed {
                height,
                reason: format!("node returned block {} for hash {}", block.hash, hash),
            });
        }

        debug!(height, txs = block.transactions.len(), "Fetched block");
        Ok(Some(block))
    }
}

pub struct RpcUtxoProvider {
    client: Arc<RpcClient>,
}

impl RpcUtxoProvider {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UtxoProvider for RpcUtxoProvider {
    async fn fetch_entry(&self, txid: &str) -> Result<Option<UtxoEntry>, ProviderError> {
        let raw = match self.client.get_raw_transaction(txid).await {
            Ok(raw) => raw,
            Err(e) if is_code(&e, RPC_NOT_FOUND) => return Ok(None),
            Err(e) => return Err(e),
        };
        let tx = decode_transaction(&raw)?;
        if tx.txid != txid {
            return Err(ProviderError::Decode(format!(
                "node returned tx {} for txid {}",
                tx.txid, txid
            )));
        }
        Ok(Some(UtxoEntry::from_transaction(&tx)))
    }
}
