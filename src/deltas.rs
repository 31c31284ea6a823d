//! Per-block delta aggregation.
//!
//! Walks a block once and produces the net signed value change of every
//! address it touches. Nothing here writes to the ledger; an error aborts the
//! block before any store call is made.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{AddressExtractor, UnsupportedScript};
use crate::error::IndexerError;
use crate::metrics;
use crate::telemetry::truncate_hex;
use crate::types::CBlock;
use crate::utxo::{InputRef, InputSource, ResolvedInput, UtxoResolver};

/// Net value change per address for exactly one block.
///
/// Zero deltas are removed before this is handed to the writer.
#[derive(Debug, Clone, Default)]
pub struct BlockDeltas {
    pub height: u32,
    pub hash: String,
    pub deltas: HashMap<String, i64>,
    pub inputs_in_block: usize,
    pub inputs_from_provider: usize,
    pub coinbase_inputs: usize,
    pub unsupported_scripts: usize,
}

impl BlockDeltas {
    fn new(height: u32, hash: String) -> Self {
        Self { height, hash, ..Default::default() }
    }

    pub fn get(&self, address: &str) -> Option<i64> {
        self.deltas.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Addresses in the deterministic order the writer batches them in.
    pub fn sorted_entries(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> =
            self.deltas.iter().map(|(addr, delta)| (addr.clone(), *delta)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn credit(&mut self, address: String, amount: i64) -> Result<(), IndexerError> {
        let slot = self.deltas.entry(address.clone()).or_insert(0);
        *slot = slot
            .checked_add(amount)
            .ok_or(IndexerError::DeltaOverflow { address })?;
        Ok(())
    }

    fn debit(&mut self, address: String, amount: i64) -> Result<(), IndexerError> {
        let negated = amount
            .checked_neg()
            .ok_or_else(|| IndexerError::DeltaOverflow { address: address.clone() })?;
        self.credit(address, negated)
    }
}

fn skip_unsupported(
    deltas: &mut BlockDeltas,
    txid: &str,
    side: &'static str,
    position: usize,
    script: &[u8],
    reason: UnsupportedScript,
) {
    deltas.unsupported_scripts += 1;
    metrics::increment_unsupported_scripts(reason.label());
    warn!(
        height = deltas.height,
        txid = %truncate_hex(txid, 16),
        side,
        position,
        script = %truncate_hex(&hex::encode(script), 64),
        reason = %reason,
        "Skipping script without a single owner"
    );
}

/// Aggregate the signed deltas of one block.
///
/// The in-block txid index and the delta map live only for this call.
pub async fn aggregate_block(
    block: &CBlock,
    resolver: &UtxoResolver,
    extractor: &AddressExtractor,
    shutdown: &CancellationToken,
) -> Result<BlockDeltas, IndexerError> {
    let in_block = block.tx_index();
    let mut deltas = BlockDeltas::new(block.height, block.hash.clone());

    for tx in &block.transactions {
        for (vin, input) in tx.inputs.iter().enumerate() {
            let input_ref = InputRef { txid: &tx.txid, vin, prevout: &input.prevout };
            match resolver.resolve(input_ref, &in_block, shutdown).await? {
                ResolvedInput::Coinbase => {
                    deltas.coinbase_inputs += 1;
                }
                ResolvedInput::Spent { value, script, source } => {
                    match source {
                        InputSource::InBlock => deltas.inputs_in_block += 1,
                        InputSource::Provider => deltas.inputs_from_provider += 1,
                    }
                    metrics::increment_inputs_resolved(source.label());

                    match extractor.extract(&script).into_address() {
                        Ok(address) => deltas.debit(address, value)?,
                        Err(reason) => {
                            skip_unsupported(&mut deltas, &tx.txid, "input", vin, &script, reason)
                        }
                    }
                }
            }
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            let script = &output.script_pubkey.script;
            match extractor.extract(script).into_address() {
                Ok(address) => deltas.credit(address, output.value)?,
                Err(reason) => skip_unsupported(&mut deltas, &tx.txid, "output", vout, script, reason),
            }
        }
    }

    let touched = deltas.deltas.len();
    deltas.deltas.retain(|_, delta| *delta != 0);

    debug!(
        height = block.height,
        txs = block.transactions.len(),
        touched,
        nonzero = deltas.deltas.len(),
        in_block = deltas.inputs_in_block,
        from_provider = deltas.inputs_from_provider,
        unsupported = deltas.unsupported_scripts,
        "Aggregated block deltas"
    );

    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{COutPoint, CScript, CTransaction, CTxIn, CTxOut, NULL_HASH};
    use crate::utxo::{MemoryUtxoProvider, RetryPolicy};
    use bitcoin::Network;
    use std::sync::Arc;

    fn p2pkh(fill: u8) -> CScript {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[fill; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        CScript { script }
    }

    fn addr(fill: u8) -> String {
        AddressExtractor::new(Network::Bitcoin)
            .extract(&p2pkh(fill).script)
            .into_address()
            .unwrap()
    }

    fn extractor() -> AddressExtractor {
        AddressExtractor::new(Network::Bitcoin)
    }

    fn resolver(provider: Arc<MemoryUtxoProvider>) -> UtxoResolver {
        UtxoResolver::new(provider, RetryPolicy::default())
    }

    #[test]
    fn test_credit_overflow() {
        let mut deltas = BlockDeltas::default();
        deltas.credit("a".to_string(), i64::MAX).unwrap();
        let err = deltas.credit("a".to_string(), 1).unwrap_err();
        assert!(matches!(err, IndexerError::DeltaOverflow { ref address } if address == "a"));
    }

    #[test]
    fn test_sorted_entries() {
        let mut deltas = BlockDeltas::default();
        deltas.credit("c".to_string(), 1).unwrap();
        deltas.credit("a".to_string(), 2).unwrap();
        deltas.debit("b".to_string(), 3).unwrap();

        let keys: Vec<String> = deltas.sorted_entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(deltas.get("b"), Some(-3));
    }

    #[tokio::test]
    async fn test_unsupported_output_is_skipped() {
        let provider = Arc::new(MemoryUtxoProvider::new());
        let block = CBlock {
            height: 5,
            hash: "11".repeat(32),
            transactions: vec![CTransaction {
                txid: "cb".to_string(),
                inputs: vec![CTxIn { prevout: COutPoint { hash: NULL_HASH.to_string(), n: u32::MAX } }],
                outputs: vec![
                    CTxOut { value: 10, script_pubkey: p2pkh(1) },
                    CTxOut { value: 0, script_pubkey: CScript { script: vec![0x6a, 0x01, 0x00] } },
                ],
            }],
        };

        let deltas = aggregate_block(&block, &resolver(provider), &extractor(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas.get(&addr(1)), Some(10));
        assert_eq!(deltas.coinbase_inputs, 1);
        assert_eq!(deltas.unsupported_scripts, 1);
    }

    #[tokio::test]
    async fn test_provider_spend_debits_origin_owner() {
        let provider = Arc::new(MemoryUtxoProvider::new());
        provider
            .insert_transaction(&CTransaction {
                txid: "old".to_string(),
                inputs: vec![],
                outputs: vec![CTxOut { value: 30, script_pubkey: p2pkh(2) }],
            })
            .await;

        let block = CBlock {
            height: 9,
            hash: "22".repeat(32),
            transactions: vec![CTransaction {
                txid: "spend".to_string(),
                inputs: vec![CTxIn { prevout: COutPoint { hash: "old".to_string(), n: 0 } }],
                outputs: vec![
                    CTxOut { value: 25, script_pubkey: p2pkh(3) },
                    CTxOut { value: 4, script_pubkey: p2pkh(2) },
                ],
            }],
        };

        let deltas = aggregate_block(&block, &resolver(provider), &extractor(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(deltas.get(&addr(2)), Some(-26));
        assert_eq!(deltas.get(&addr(3)), Some(25));
        assert_eq!(deltas.inputs_from_provider, 1);
    }

    #[tokio::test]
    async fn test_unsupported_origin_skips_only_the_debit() {
        let provider = Arc::new(MemoryUtxoProvider::new());
        provider
            .insert_transaction(&CTransaction {
                txid: "burn".to_string(),
                inputs: vec![],
                outputs: vec![CTxOut { value: 7, script_pubkey: CScript { script: vec![0x6a, 0x01, 0x00] } }],
            })
            .await;

        let block = CBlock {
            height: 12,
            hash: "33".repeat(32),
            transactions: vec![CTransaction {
                txid: "respend".to_string(),
                inputs: vec![CTxIn { prevout: COutPoint { hash: "burn".to_string(), n: 0 } }],
                outputs: vec![CTxOut { value: 7, script_pubkey: p2pkh(0x55) }],
            }],
        };

        let deltas = aggregate_block(&block, &resolver(provider.clone()), &extractor(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(deltas.sorted_entries(), vec![(addr(0x55), 7)]);
        assert_eq!(deltas.unsupported_scripts, 1);
        assert_eq!(deltas.inputs_from_provider, 1);
        assert_eq!(provider.calls(), 1);
    }
}
