//! Script decoder backed by the ledger node's own address annotations.

use kinship_core::constants::Network;
use kinship_core::error::DecodeError;
use kinship_core::traits::ScriptDecoder;
use kinship_core::types::{Address, ScriptPubKey};

/// `OP_RETURN`: provably unspendable, never has an owner.
const OP_RETURN: u8 = 0x6a;

/// Returns the addresses the node already derived for a script.
///
/// The node encodes addresses for its own network, so `network` is not
/// consulted. The script hex is still validated; null-data scripts are
/// rejected if they carry addresses, since no one can own them.
///
/// Nothing is derived locally. Current bitcoind leaves pay-to-pubkey and
/// bare multisig outputs unannotated, so against a real node those decode
/// to no addresses and take no part in clustering. That covers most early
/// coinbase outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeScriptDecoder;

impl ScriptDecoder for NodeScriptDecoder {
    fn decode_addresses(
        &self,
        script: &ScriptPubKey,
        _network: Network,
    ) -> Result<Vec<Address>, DecodeError> {
        let bytes = hex::decode(&script.hex).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        if bytes.first() == Some(&OP_RETURN) && !script.addresses.is_empty() {
            return Err(DecodeError::Unsupported(
                "null-data script annotated with addresses".into(),
            ));
        }
        Ok(script.addresses.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(hex: &str, addrs: &[&str]) -> ScriptPubKey {
        ScriptPubKey {
            hex: hex.into(),
            addresses: addrs.iter().map(|a| Address::from(*a)).collect(),
        }
    }

    #[test]
    fn returns_annotations() {
        let s = script("76a914", &["1BoatSLRHtKNngkdXEeobR76b53LETtpyT"]);
        let out = NodeScriptDecoder
            .decode_addresses(&s, Network::Mainnet)
            .unwrap();
        assert_eq!(out, vec![Address::from("1BoatSLRHtKNngkdXEeobR76b53LETtpyT")]);
    }

    #[test]
    fn multisig_yields_every_signer() {
        let s = script("5121", &["k1", "k2", "k3"]);
        assert_eq!(
            NodeScriptDecoder
                .decode_addresses(&s, Network::Mainnet)
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn unannotated_pay_to_pubkey_has_no_addresses() {
        // 65-byte uncompressed key followed by OP_CHECKSIG.
        let hex = format!("41{}ac", "04".repeat(65));
        let s = script(&hex, &[]);
        assert!(NodeScriptDecoder
            .decode_addresses(&s, Network::Mainnet)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn null_data_has_no_owner() {
        let s = script("6a0568656c6c6f", &[]);
        assert!(NodeScriptDecoder
            .decode_addresses(&s, Network::Mainnet)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn null_data_with_addresses_is_rejected() {
        let s = script("6a00", &["bogus"]);
        assert!(matches!(
            NodeScriptDecoder.decode_addresses(&s, Network::Mainnet),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn invalid_hex_is_rejected() {
        let s = script("zz", &["a"]);
        assert!(matches!(
            NodeScriptDecoder.decode_addresses(&s, Network::Testnet),
            Err(DecodeError::InvalidHex(_))
        ));
    }
}
