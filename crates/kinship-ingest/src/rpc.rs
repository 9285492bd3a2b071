//! JSON-RPC ledger source for bitcoind-compatible nodes.
//!
//! Uses the jsonrpsee HTTP client with basic auth. Blocks are fetched with
//! `getblock <hash> 2` so every transaction arrives decoded; spent outputs
//! are dereferenced with `getrawtransaction <txid> true`, which needs a
//! node running with `-txindex`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::core::ClientError;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use kinship_core::constants::COIN;
use kinship_core::error::LedgerError;
use kinship_core::traits::LedgerSource;
use kinship_core::types::{Address, Block, Hash256, ScriptPubKey, Transaction, TxInput, TxOutput};

/// `RPC_INVALID_ADDRESS_OR_KEY`: unknown transaction or block.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
/// `RPC_INVALID_PARAMETER`: e.g. block height out of range.
const RPC_INVALID_PARAMETER: i32 = -8;

/// Block as returned by `getblock <hash> 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub hash: String,
    pub height: u64,
    pub tx: Vec<RawTransaction>,
}

/// Transaction as returned by `getrawtransaction <txid> true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    pub vin: Vec<RawInput>,
    pub vout: Vec<RawOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutput {
    /// Amount in whole coins.
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RawScript,
}

/// Newer nodes report a single `address`, older ones an `addresses` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScript {
    pub hex: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = LedgerError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let txid = parse_hash(&raw.txid)?;

        let inputs = raw
            .vin
            .into_iter()
            .map(|vin| match (vin.coinbase, vin.txid, vin.vout) {
                (Some(_), _, _) => Ok(TxInput::coinbase()),
                (None, Some(prev), Some(index)) => Ok(TxInput::spending(parse_hash(&prev)?, index)),
                _ => Err(malformed(format!("input of {txid} has no previous output"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut vout = raw.vout;
        vout.sort_by_key(|o| o.n);
        let outputs = vout
            .into_iter()
            .map(|out| {
                let script = out.script_pub_key;
                let mut addresses: Vec<Address> =
                    script.addresses.into_iter().map(Address::from).collect();
                if let Some(address) = script.address {
                    if !addresses.iter().any(|a| a.as_str() == address) {
                        addresses.insert(0, Address::from(address));
                    }
                }
                TxOutput {
                    value: (out.value * COIN as f64).round() as u64,
                    script_pubkey: ScriptPubKey {
                        hex: script.hex,
                        addresses,
                    },
                }
            })
            .collect();

        Ok(Transaction {
            txid,
            inputs,
            outputs,
        })
    }
}

impl TryFrom<RawBlock> for Block {
    type Error = LedgerError;

    fn try_from(raw: RawBlock) -> Result<Self, Self::Error> {
        Ok(Block {
            height: raw.height,
            hash: parse_hash(&raw.hash)?,
            transactions: raw
                .tx
                .into_iter()
                .map(Transaction::try_from)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

/// Ledger source talking to a bitcoind-compatible JSON-RPC endpoint.
pub struct RpcLedgerSource {
    client: HttpClient,
    endpoint: String,
}

impl RpcLedgerSource {
    /// Build a client for `url`, with basic auth when `user` is set.
    pub fn connect(
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let mut headers = HeaderMap::new();
        if let Some(user) = user {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{user}:{}", password.unwrap_or_default()));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| LedgerError::Unavailable(format!("invalid credentials: {e}")))?;
            headers.insert("authorization", value);
        }

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(timeout)
            .build(url)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: url.to_string(),
        })
    }

    /// The configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: ArrayParams,
        what: &str,
    ) -> Result<T, LedgerError> {
        debug!(method, what, "rpc call");
        self.client
            .request(method, params)
            .await
            .map_err(|e| classify(e, what))
    }
}

#[async_trait]
impl LedgerSource for RpcLedgerSource {
    async fn height(&self) -> Result<u64, LedgerError> {
        self.call("getblockcount", ArrayParams::new(), "tip").await
    }

    async fn block_at(&self, height: u64) -> Result<Block, LedgerError> {
        let what = format!("block {height}");
        let hash: String = self
            .call("getblockhash", params([serde_json::json!(height)])?, &what)
            .await?;
        let raw: RawBlock = self
            .call(
                "getblock",
                params([serde_json::json!(hash), serde_json::json!(2)])?,
                &what,
            )
            .await?;
        Block::try_from(raw)
    }

    async fn transaction(&self, txid: &Hash256) -> Result<Transaction, LedgerError> {
        let what = format!("transaction {txid}");
        let raw: RawTransaction = self
            .call(
                "getrawtransaction",
                params([serde_json::json!(txid.to_string()), serde_json::json!(true)])?,
                &what,
            )
            .await?;
        Transaction::try_from(raw)
    }
}

fn params<const N: usize>(values: [serde_json::Value; N]) -> Result<ArrayParams, LedgerError> {
    let mut params = ArrayParams::new();
    for value in values {
        params
            .insert(value)
            .map_err(|e| LedgerError::Transient(format!("encode params: {e}")))?;
    }
    Ok(params)
}

/// Map a client error onto the ledger error taxonomy.
fn classify(err: ClientError, what: &str) -> LedgerError {
    match err {
        ClientError::Call(obj)
            if obj.code() == RPC_INVALID_ADDRESS_OR_KEY || obj.code() == RPC_INVALID_PARAMETER =>
        {
            LedgerError::NotFound(format!("{what}: {}", obj.message()))
        }
        ClientError::Call(obj) => LedgerError::Transient(format!("{what}: {}", obj.message())),
        ClientError::RequestTimeout => LedgerError::Timeout,
        ClientError::Transport(e) => {
            // Legacy nodes answer RPC errors with HTTP 404/500, which the
            // client surfaces as a rejected request rather than a call error.
            let msg = e.to_string();
            if msg.contains("404") {
                LedgerError::NotFound(format!("{what}: {msg}"))
            } else if msg.contains("500") || msg.contains("503") {
                LedgerError::Transient(format!("{what}: {msg}"))
            } else {
                LedgerError::Unavailable(format!("{what}: {msg}"))
            }
        }
        ClientError::ParseError(e) => LedgerError::Malformed(format!("{what}: {e}")),
        other => LedgerError::Transient(format!("{what}: {other}")),
    }
}

fn parse_hash(s: &str) -> Result<Hash256, LedgerError> {
    s.parse::<Hash256>()
        .map_err(|e| malformed(format!("bad hash {s}: {e}")))
}

fn malformed(msg: String) -> LedgerError {
    LedgerError::Malformed(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::types::ErrorObjectOwned;

    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
    const PREV: &str = "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098";

    fn raw_tx_json() -> serde_json::Value {
        serde_json::json!({
            "txid": TXID,
            "vin": [
                { "txid": PREV, "vout": 0, "sequence": 4294967295u64 },
                { "txid": PREV, "vout": 1 }
            ],
            "vout": [
                { "value": 0.5, "n": 1, "scriptPubKey": { "hex": "0014ab", "type": "witness_v0_keyhash", "address": "bc1qchange" } },
                { "value": 49.5, "n": 0, "scriptPubKey": { "hex": "76a914cd", "addresses": ["1Payee"] } },
                { "value": 0.0, "n": 2, "scriptPubKey": { "hex": "6a00", "type": "nulldata" } }
            ]
        })
    }

    #[test]
    fn raw_transaction_converts() {
        let raw: RawTransaction = serde_json::from_value(raw_tx_json()).unwrap();
        let tx = Transaction::try_from(raw).unwrap();

        assert_eq!(tx.txid.to_string(), TXID);
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(
            tx.inputs[1].previous_output.unwrap().index,
            1
        );
        // Outputs are ordered by `n`.
        assert_eq!(tx.outputs[0].value, 49 * COIN + COIN / 2);
        assert_eq!(tx.outputs[0].script_pubkey.addresses, vec![Address::from("1Payee")]);
        assert_eq!(tx.outputs[1].script_pubkey.addresses, vec![Address::from("bc1qchange")]);
        assert!(tx.outputs[2].script_pubkey.addresses.is_empty());
    }

    #[test]
    fn coinbase_input_converts_to_absent_reference() {
        let raw: RawTransaction = serde_json::from_value(serde_json::json!({
            "txid": TXID,
            "vin": [{ "coinbase": "04ffff001d0104" }],
            "vout": [{ "value": 50.0, "n": 0, "scriptPubKey": { "hex": "41ac", "address": "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa" } }]
        }))
        .unwrap();
        let tx = Transaction::try_from(raw).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs[0].value, 50 * COIN);
    }

    #[test]
    fn input_without_reference_is_malformed() {
        let raw: RawTransaction = serde_json::from_value(serde_json::json!({
            "txid": TXID,
            "vin": [{ "sequence": 1 }],
            "vout": []
        }))
        .unwrap();
        assert!(matches!(Transaction::try_from(raw), Err(LedgerError::Malformed(_))));
    }

    #[test]
    fn raw_block_converts() {
        let raw: RawBlock = serde_json::from_value(serde_json::json!({
            "hash": PREV,
            "height": 170,
            "tx": [raw_tx_json()]
        }))
        .unwrap();
        let block = Block::try_from(raw).unwrap();
        assert_eq!(block.height, 170);
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn bad_hash_is_malformed() {
        let err = parse_hash("xyz").unwrap_err();
        assert!(matches!(err, LedgerError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_unparseable_response_is_malformed() {
        let bad = serde_json::from_str::<u64>("\"tip\"").unwrap_err();
        let err = classify(ClientError::ParseError(bad), "tip");
        assert!(matches!(err, LedgerError::Malformed(_)));
        assert!(err.is_skippable());
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_not_found_call_error() {
        let err = ClientError::Call(ErrorObjectOwned::owned::<()>(
            RPC_INVALID_ADDRESS_OR_KEY,
            "No such mempool or blockchain transaction",
            None,
        ));
        assert!(matches!(classify(err, "tx"), LedgerError::NotFound(_)));
    }

    #[test]
    fn classify_other_call_error_is_transient() {
        let err = ClientError::Call(ErrorObjectOwned::owned::<()>(-28, "Loading block index", None));
        assert!(matches!(classify(err, "tip"), LedgerError::Transient(_)));
    }

    #[test]
    fn classify_timeout() {
        assert_eq!(classify(ClientError::RequestTimeout, "tip"), LedgerError::Timeout);
    }

    #[test]
    fn connect_builds_client_with_credentials() {
        let source = RpcLedgerSource::connect(
            "http://127.0.0.1:8332",
            Some("user"),
            Some("pass"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(source.endpoint(), "http://127.0.0.1:8332");
    }
}
