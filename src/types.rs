use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

pub const NULL_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A confirmed block as handed over by the block source.
#[derive(Clone)]
pub struct CBlock {
    pub height: u32,
    pub hash: String,
    pub transactions: Vec<CTransaction>,
}

impl std::fmt::Debug for CBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Block {{")?;
        writeln!(f, "    height: {}", self.height)?;
        writeln!(f, "    hash: {}", self.hash)?;
        writeln!(f, "    tx_count: {}", self.transactions.len())?;
        write!(f, "}}")
    }
}

impl CBlock {
    /// Convert a consensus-decoded block. Heights are not part of the block
    /// encoding, so the caller supplies the one it asked for.
    pub fn from_bitcoin(height: u32, block: &bitcoin::Block) -> Result<Self, SourceError> {
        let transactions = block
            .txdata
            .iter()
            .map(|tx| CTransaction::from_bitcoin(tx).map_err(|reason| SourceError::Malformed { height, reason }))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CBlock {
            height,
            hash: block.block_hash().to_string(),
            transactions,
        })
    }

    /// Index every transaction of the block by txid.
    pub fn tx_index(&self) -> HashMap<&str, &CTransaction> {
        self.transactions
            .iter()
            .map(|tx| (tx.txid.as_str(), tx))
            .collect()
    }
}

#[derive(Clone)]
pub struct CTransaction {
    pub txid: String,
    pub inputs: Vec<CTxIn>,
    pub outputs: Vec<CTxOut>,
}

impl std::fmt::Debug for CTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Transaction {{")?;
        writeln!(f, "    txid: {}", self.txid)?;
        writeln!(f, "    inputs: {:?}", self.inputs)?;
        writeln!(f, "    outputs: {:?}", self.outputs)?;
        writeln!(f, "}}")?;
        Ok(())
    }
}

impl CTransaction {
    pub fn from_bitcoin(tx: &bitcoin::Transaction) -> Result<Self, String> {
        let txid = tx.txid().to_string();

        let inputs = tx
            .input
            .iter()
            .map(|input| CTxIn {
                prevout: COutPoint {
                    hash: input.previous_output.txid.to_string(),
                    n: input.previous_output.vout,
                },
            })
            .collect();

        let outputs = tx
            .output
            .iter()
            .enumerate()
            .map(|(n, output)| {
                let value = i64::try_from(output.value)
                    .map_err(|_| format!("output {}:{} value {} exceeds i64", txid, n, output.value))?;
                Ok(CTxOut {
                    value,
                    script_pubkey: CScript {
                        script: output.script_pubkey.to_bytes(),
                    },
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(CTransaction { txid, inputs, outputs })
    }
}

#[derive(Clone)]
pub struct CTxIn {
    pub prevout: COutPoint,
}

impl std::fmt::Debug for CTxIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ prevout: {:?} }}", self.prevout)
    }
}

#[derive(Clone)]
pub struct CTxOut {
    pub value: i64,
    pub script_pubkey: CScript,
}

impl fmt::Debug for CTxOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ value: {}, script_pubkey: {:?} }}", self.value, self.script_pubkey)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct COutPoint {
    pub hash: String,
    pub n: u32,
}

impl COutPoint {
    /// Coinbase inputs reference the all-zero txid.
    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH
    }
}

impl fmt::Display for COutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.n)
    }
}

#[derive(Clone, Default)]
pub struct CScript {
    pub script: Vec<u8>,
}

impl std::fmt::Debug for CScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", hex::encode(&self.script))
    }
}

/// One persisted ledger row.
///
/// `height` is the last block whose delta was folded into `value`; it is the
/// guard that keeps a re-applied block from counting twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub address: String,
    pub value: i64,
    pub height: u32,
}

/// Last block whose delta map was applied completely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTip {
    pub height: u32,
    pub hash: String,
}

/// Mainnet genesis block, consensus encoded.
#[cfg(test)]
pub(crate) const GENESIS_BLOCK_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";
