/// Engine configuration from environment variables
///
/// Controls the Bitcoin network, the Electrum node endpoint and the
/// background resync cadence. Defaults to mainnet over TLS.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Wire transport used to reach the Electrum node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Tls,
}

#[derive(Clone, Debug)]
pub struct ElectrumConfig {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    /// Client identity sent in the `server.version` handshake
    pub client_name: String,
    pub protocol_version: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
}

impl ElectrumConfig {
    /// Public Blockstream node for the given network
    pub fn default_for(network: bitcoin::Network) -> Self {
        let port = match network {
            bitcoin::Network::Bitcoin => 50002,
            _ => 60002,
        };
        Self {
            host: "electrum.blockstream.info".to_string(),
            port,
            transport: Transport::Tls,
            client_name: "inheritance-engine".to_string(),
            protocol_version: "1.4".to_string(),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Bitcoin network type (for bitcoin crate)
    pub bitcoin_network: bitcoin::Network,
    pub electrum: ElectrumConfig,
    /// Directory holding the JSON store
    pub data_dir: PathBuf,
    /// Interval between full wallet resyncs
    pub resync_interval: Duration,
    /// Interval between keepalive pings to the Electrum node
    pub keepalive_interval: Duration,
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BITCOIN_NETWORK`: "mainnet" (default), "testnet", "signet" or "regtest"
    /// - `ELECTRUM_HOST` / `ELECTRUM_PORT`: node endpoint (defaults to Blockstream)
    /// - `ELECTRUM_TRANSPORT`: "ssl" (default) or "tcp"
    /// - `ELECTRUM_RECONNECT_SECS`: reconnect backoff (default 5)
    /// - `ELECTRUM_TIMEOUT_SECS`: per-request timeout (default 30)
    /// - `DATA_DIR`: store location (default `./engine-data`)
    /// - `RESYNC_INTERVAL_SECS`: full resync cadence (default 600)
    /// - `KEEPALIVE_SECS`: ping cadence (default 60)
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Mainnet through Blockstream (default)
    /// cargo run
    ///
    /// # Local regtest electrs
    /// BITCOIN_NETWORK=regtest ELECTRUM_HOST=127.0.0.1 ELECTRUM_PORT=50001 ELECTRUM_TRANSPORT=tcp cargo run
    /// ```
    pub fn from_env() -> Self {
        let network_str = env::var("BITCOIN_NETWORK")
            .unwrap_or_else(|_| "mainnet".to_string())
            .to_lowercase();

        let bitcoin_network = match network_str.as_str() {
            "mainnet" | "bitcoin" | "" => {
                log::info!("🌐 Using MAINNET network");
                bitcoin::Network::Bitcoin
            }
            "testnet" | "tbtc" => {
                log::info!("🧪 Using TESTNET network");
                bitcoin::Network::Testnet
            }
            "signet" => {
                log::info!("🌐 Using SIGNET network");
                bitcoin::Network::Signet
            }
            "regtest" => {
                log::info!("🔧 Using REGTEST network");
                bitcoin::Network::Regtest
            }
            other => {
                log::warn!("⚠️  Unknown network '{}', defaulting to mainnet", other);
                bitcoin::Network::Bitcoin
            }
        };

        let mut electrum = ElectrumConfig::default_for(bitcoin_network);
        if let Ok(host) = env::var("ELECTRUM_HOST") {
            electrum.host = host;
        }
        if let Some(port) = parse_var::<u16>("ELECTRUM_PORT") {
            electrum.port = port;
        }
        if let Ok(transport) = env::var("ELECTRUM_TRANSPORT") {
            electrum.transport = match transport.to_lowercase().as_str() {
                "tcp" => Transport::Tcp,
                "ssl" | "tls" => Transport::Tls,
                other => {
                    log::warn!("⚠️  Unknown transport '{}', using TLS", other);
                    Transport::Tls
                }
            };
        }
        if let Some(secs) = parse_var::<u64>("ELECTRUM_RECONNECT_SECS") {
            electrum.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("ELECTRUM_TIMEOUT_SECS") {
            electrum.request_timeout = Duration::from_secs(secs);
        }
        log::info!("📡 Electrum node: {} ({:?})", electrum.endpoint(), electrum.transport);

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./engine-data"));
        log::info!("💾 Data directory: {}", data_dir.display());

        let resync_interval =
            Duration::from_secs(parse_var::<u64>("RESYNC_INTERVAL_SECS").unwrap_or(600));
        let keepalive_interval = Duration::from_secs(parse_var::<u64>("KEEPALIVE_SECS").unwrap_or(60));

        Self {
            bitcoin_network,
            electrum,
            data_dir,
            resync_interval,
            keepalive_interval,
        }
    }

    /// Get the BIP44 coin type for this network
    ///
    /// - Mainnet: 0
    /// - Testnet/Signet/Regtest: 1
    pub fn coin_type(&self) -> u32 {
        coin_type(self.bitcoin_network)
    }
}

/// BIP44 coin type for a network
pub fn coin_type(network: bitcoin::Network) -> u32 {
    match network {
        bitcoin::Network::Bitcoin => 0,
        _ => 1, // All test networks use coin type 1
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("⚠️  Ignoring unparsable {}='{}'", name, raw);
            None
        }
    }
}

impl Default for EngineConfig {
    /// Default configuration (mainnet)
    fn default() -> Self {
        Self {
            bitcoin_network: bitcoin::Network::Bitcoin,
            electrum: ElectrumConfig::default_for(bitcoin::Network::Bitcoin),
            data_dir: PathBuf::from("./engine-data"),
            resync_interval: Duration::from_secs(600),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}
