// address.rs

use std::fmt;
use bitcoin::{Address, Network, PublicKey, Script};

const OP_0: u8 = 0x00;
const OP_PUSH_20: u8 = 0x14;
const OP_PUSH_32: u8 = 0x20;
const OP_PUSH_33: u8 = 0x21;
const OP_PUSH_65: u8 = 0x41;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Owner of an output script.
///
/// Exactly five script forms map to a ledger address; anything else is
/// `Unsupported` and the caller skips that single contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptAddress {
    P2PKH(String),
    P2SH(String),
    /// Pay-to-pubkey, rendered as the pubkey-hash address of the key.
    P2PK(String),
    P2WSH(String),
    P2WPKH(String),
    Unsupported(UnsupportedScript),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedScript {
    Empty,
    NullData,
    Multisig { keys: usize },
    InvalidPubKey,
    NonStandard,
}

impl UnsupportedScript {
    pub fn label(&self) -> &'static str {
        match self {
            UnsupportedScript::Empty => "empty",
            UnsupportedScript::NullData => "nulldata",
            UnsupportedScript::Multisig { .. } => "multisig",
            UnsupportedScript::InvalidPubKey => "invalid_pubkey",
            UnsupportedScript::NonStandard => "nonstandard",
        }
    }
}

impl fmt::Display for UnsupportedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedScript::Multisig { keys } => write!(f, "multisig with {} keys", keys),
            other => write!(f, "{}", other.label()),
        }
    }
}

impl ScriptAddress {
    /// The ledger key, if the script has a single owner.
    pub fn address(&self) -> Option<&str> {
        match self {
            ScriptAddress::P2PKH(addr)
            | ScriptAddress::P2SH(addr)
            | ScriptAddress::P2PK(addr)
            | ScriptAddress::P2WSH(addr)
            | ScriptAddress::P2WPKH(addr) => Some(addr),
            ScriptAddress::Unsupported(_) => None,
        }
    }

    pub fn into_address(self) -> Result<String, UnsupportedScript> {
        match self {
            ScriptAddress::P2PKH(addr)
            | ScriptAddress::P2SH(addr)
            | ScriptAddress::P2PK(addr)
            | ScriptAddress::P2WSH(addr)
            | ScriptAddress::P2WPKH(addr) => Ok(addr),
            ScriptAddress::Unsupported(reason) => Err(reason),
        }
    }
}

/// Decodes output scripts into ledger addresses for one network.
#[derive(Debug, Clone, Copy)]
pub struct AddressExtractor {
    network: Network,
}

impl AddressExtractor {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn extract(&self, script: &[u8]) -> ScriptAddress {
        match script {
            [] => ScriptAddress::Unsupported(UnsupportedScript::Empty),
            [OP_RETURN, ..] => ScriptAddress::Unsupported(UnsupportedScript::NullData),
            [OP_DUP, OP_HASH160, OP_PUSH_20, .., OP_EQUALVERIFY, OP_CHECKSIG] if script.len() == 25 => {
                self.render(script, ScriptAddress::P2PKH)
            }
            [OP_HASH160, OP_PUSH_20, .., OP_EQUAL] if script.len() == 23 => {
                self.render(script, ScriptAddress::P2SH)
            }
            [OP_0, OP_PUSH_20, ..] if script.len() == 22 => self.render(script, ScriptAddress::P2WPKH),
            [OP_0, OP_PUSH_32, ..] if script.len() == 34 => self.render(script, ScriptAddress::P2WSH),
            [OP_PUSH_33, .., OP_CHECKSIG] if script.len() == 35 => self.pubkey_address(&script[1..34]),
            [OP_PUSH_65, .., OP_CHECKSIG] if script.len() == 67 => self.pubkey_address(&script[1..66]),
            [m, .., n, OP_CHECKMULTISIG] if is_small_int(*m) && is_small_int(*n) => self.multisig(script),
            _ => ScriptAddress::Unsupported(UnsupportedScript::NonStandard),
        }
    }

    fn render(&self, script: &[u8], kind: fn(String) -> ScriptAddress) -> ScriptAddress {
        let script = Script::from(script.to_vec());
        match Address::from_script(&script, self.network) {
            Some(addr) => kind(addr.to_string()),
            None => ScriptAddress::Unsupported(UnsupportedScript::NonStandard),
        }
    }

    fn pubkey_address(&self, pubkey: &[u8]) -> ScriptAddress {
        match PublicKey::from_slice(pubkey) {
            Ok(key) => ScriptAddress::P2PK(Address::p2pkh(&key, self.network).to_string()),
            Err(_) => ScriptAddress::Unsupported(UnsupportedScript::InvalidPubKey),
        }
    }

    /// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`. Keys that do not parse are
    /// dropped; a script left with one valid key has that key as its only
    /// owner and is treated like pay-to-pubkey.
    fn multisig(&self, script: &[u8]) -> ScriptAddress {
        let body = &script[1..script.len() - 2];
        let mut pushed = 0usize;
        let mut keys: Vec<PublicKey> = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            let (start, len) = match body[pos..] {
                [OP_PUSH_33, ..] => (pos + 1, 33),
                [OP_PUSH_65, ..] => (pos + 1, 65),
                [OP_PUSHDATA1, len @ (33 | 65), ..] => (pos + 2, len as usize),
                _ => return ScriptAddress::Unsupported(UnsupportedScript::NonStandard),
            };
            let end = start + len;
            if end > body.len() {
                return ScriptAddress::Unsupported(UnsupportedScript::NonStandard);
            }
            pushed += 1;
            if let Ok(key) = PublicKey::from_slice(&body[start..end]) {
                keys.push(key);
            }
            pos = end;
        }

        let declared = (script[script.len() - 2] - OP_1 + 1) as usize;
        if pushed == 0 || declared != pushed {
            return ScriptAddress::Unsupported(UnsupportedScript::NonStandard);
        }

        match keys.as_slice() {
            [] => ScriptAddress::Unsupported(UnsupportedScript::InvalidPubKey),
            [single] => ScriptAddress::P2PK(Address::p2pkh(single, self.network).to_string()),
            _ => ScriptAddress::Unsupported(UnsupportedScript::Multisig { keys: keys.len() }),
        }
    }
}

fn is_small_int(op: u8) -> bool {
    (OP_1..=OP_16).contains(&op)
}

/// Parse a configured network name.
pub fn parse_network(name: &str) -> Option<Network> {
    match name.to_ascii_lowercase().as_str() {
        "bitcoin" | "mainnet" | "main" => Some(Network::Bitcoin),
        "testnet" | "test" => Some(Network::Testnet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Uncompressed key paid by the genesis coinbase.
    const GENESIS_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";
    // Generator point, compressed.
    const G_COMPRESSED: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn mainnet() -> AddressExtractor {
        AddressExtractor::new(Network::Bitcoin)
    }

    fn p2pk(pubkey_hex: &str) -> Vec<u8> {
        let key = hex::decode(pubkey_hex).unwrap();
        let mut script = vec![key.len() as u8];
        script.extend_from_slice(&key);
        script.push(OP_CHECKSIG);
        script
    }

    #[test]
    fn test_p2pkh() {
        let script = hex::decode("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap();
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::P2PKH("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string())
        );
    }

    #[test]
    fn test_p2pkh_testnet() {
        let script = hex::decode("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap();
        let extractor = AddressExtractor::new(Network::Testnet);
        assert_eq!(extractor.extract(&script).address(), Some("mpXwg4jMtRhuSpVq4xS3HFHmCmWp9NyGKt"));
    }

    #[test]
    fn test_p2sh() {
        let script = hex::decode("a9148f55563b9a19f321c211e9b9f38cdf686ea0784587").unwrap();
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::P2SH("3EktnHQD7RiAE6uzMj2ZifT9YgRrkSgzQX".to_string())
        );
    }

    #[test]
    fn test_p2pk_uncompressed_normalizes_to_pubkey_hash() {
        let script = p2pk(GENESIS_PUBKEY);
        assert_eq!(script.len(), 67);
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::P2PK("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string())
        );
    }

    #[test]
    fn test_p2pk_compressed() {
        let script = p2pk(G_COMPRESSED);
        assert_eq!(
            mainnet().extract(&script).address(),
            Some("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH")
        );
    }

    #[test]
    fn test_p2pk_invalid_key() {
        let mut key = vec![0x02];
        key.extend_from_slice(&[0xff; 32]);
        let mut script = vec![OP_PUSH_33];
        script.extend_from_slice(&key);
        script.push(OP_CHECKSIG);
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::Unsupported(UnsupportedScript::InvalidPubKey)
        );
    }

    #[test]
    fn test_p2wpkh() {
        let script = hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::P2WPKH("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string())
        );
    }

    #[test]
    fn test_p2wsh() {
        let script =
            hex::decode("00201863143c14c5166804bd19203356da136c985678cd4d27a1b8c6329604903262").unwrap();
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::P2WSH("bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3".to_string())
        );
    }

    #[test]
    fn test_taproot_is_unsupported() {
        let mut script = vec![0x51, 0x20];
        script.extend_from_slice(&[0x11; 32]);
        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::Unsupported(UnsupportedScript::NonStandard)
        );
    }

    #[test]
    fn test_bare_multisig_two_keys_is_unsupported() {
        let key_a = hex::decode(G_COMPRESSED).unwrap();
        let key_b = hex::decode(&GENESIS_PUBKEY[..]).unwrap();
        let mut script = vec![OP_1, OP_PUSH_33];
        script.extend_from_slice(&key_a);
        script.push(OP_PUSH_65);
        script.extend_from_slice(&key_b);
        script.push(0x52); // OP_2
        script.push(OP_CHECKMULTISIG);

        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::Unsupported(UnsupportedScript::Multisig { keys: 2 })
        );
    }

    #[test]
    fn test_single_key_multisig_has_one_owner() {
        let key = hex::decode(G_COMPRESSED).unwrap();
        let mut script = vec![OP_1, OP_PUSH_33];
        script.extend_from_slice(&key);
        script.push(OP_1);
        script.push(OP_CHECKMULTISIG);

        assert_eq!(
            mainnet().extract(&script).address(),
            Some("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH")
        );
    }

    #[test]
    fn test_multisig_drops_unparseable_keys() {
        let valid = hex::decode(G_COMPRESSED).unwrap();
        let mut invalid = vec![0x02];
        invalid.extend_from_slice(&[0xff; 32]);

        let mut script = vec![OP_1, OP_PUSH_33];
        script.extend_from_slice(&invalid);
        script.push(OP_PUSH_33);
        script.extend_from_slice(&valid);
        script.push(0x52); // OP_2
        script.push(OP_CHECKMULTISIG);

        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::P2PK("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".to_string())
        );
    }

    #[test]
    fn test_multisig_without_valid_keys() {
        let mut invalid = vec![0x02];
        invalid.extend_from_slice(&[0xff; 32]);
        let mut script = vec![OP_1, OP_PUSH_33];
        script.extend_from_slice(&invalid);
        script.push(OP_1);
        script.push(OP_CHECKMULTISIG);

        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::Unsupported(UnsupportedScript::InvalidPubKey)
        );
    }

    #[test]
    fn test_multisig_key_pushed_with_pushdata1() {
        let key = hex::decode(G_COMPRESSED).unwrap();
        let mut script = vec![OP_1, OP_PUSHDATA1, 33];
        script.extend_from_slice(&key);
        script.push(OP_1);
        script.push(OP_CHECKMULTISIG);

        assert_eq!(
            mainnet().extract(&script).address(),
            Some("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH")
        );
    }

    #[test]
    fn test_multisig_key_count_mismatch() {
        let key = hex::decode(G_COMPRESSED).unwrap();
        let mut script = vec![OP_1, OP_PUSH_33];
        script.extend_from_slice(&key);
        script.push(0x53); // OP_3, but only one key
        script.push(OP_CHECKMULTISIG);

        assert_eq!(
            mainnet().extract(&script),
            ScriptAddress::Unsupported(UnsupportedScript::NonStandard)
        );
    }

    #[test]
    fn test_empty_and_nulldata() {
        assert_eq!(mainnet().extract(&[]), ScriptAddress::Unsupported(UnsupportedScript::Empty));
        assert_eq!(
            mainnet().extract(&[OP_RETURN, 0x04, 0xde, 0xad, 0xbe, 0xef]),
            ScriptAddress::Unsupported(UnsupportedScript::NullData)
        );
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("bitcoin"), Some(Network::Bitcoin));
        assert_eq!(parse_network("Testnet"), Some(Network::Testnet));
        assert_eq!(parse_network("regtest"), Some(Network::Regtest));
        assert_eq!(parse_network("dogecoin"), None);
    }
}
