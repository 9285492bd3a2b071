//! Clustering and ingestion constants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Satoshis per whole coin. RPC amounts arrive as decimal coins.
pub const COIN: u64 = 100_000_000;

/// Members returned per page by a cluster lookup.
pub const MEMBER_PAGE_SIZE: usize = 100;

/// Default JSON-RPC port of a mainnet ledger node.
pub const DEFAULT_RPC_PORT: u16 = 8332;

/// Default number of blocks between persisted checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1000;

/// Default per-lookup timeout against the ledger source (seconds).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default retries for a transient ledger lookup failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff between retries (milliseconds).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

/// Default bound on concurrent previous-output lookups per transaction.
pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 16;

/// Ledger network whose address encoding the script decoder targets.
///
/// # Examples
///
/// ```
/// use kinship_core::constants::Network;
/// let net: Network = "testnet".parse().unwrap();
/// assert_eq!(net, Network::Testnet);
/// assert_eq!(Network::default(), Network::Mainnet);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network.
    Regtest,
}

impl Network {
    /// Default JSON-RPC port for a node on this network.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => DEFAULT_RPC_PORT,
            Network::Testnet => 18332,
            Network::Regtest => 18443,
        }
    }

    /// Subdirectory appended to the data directory so networks never share state.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.data_dir_suffix())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_ports_differ_per_network() {
        assert_eq!(Network::Mainnet.default_rpc_port(), 8332);
        assert_eq!(Network::Testnet.default_rpc_port(), 18332);
        assert_eq!(Network::Regtest.default_rpc_port(), 18443);
    }

    #[test]
    fn parse_accepts_short_names() {
        assert_eq!("main".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("TEST".parse::<Network>().unwrap(), Network::Testnet);
        assert!("signet".parse::<Network>().is_err());
    }

    #[test]
    fn display_matches_data_dir_suffix() {
        for net in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            assert_eq!(net.to_string(), net.data_dir_suffix());
        }
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&Network::Regtest).unwrap();
        assert_eq!(json, "\"regtest\"");
    }
}
