use std::path::PathBuf;

use alloy_primitives::Address;
use clap::Parser;
use forks::schedule::UnknownNetwork;
use forks::Network;
use serde::Deserialize;
use sync::{Checkpoint, SyncMode, Whitelist};
use thiserror::Error;

// ============================================================================
// CLI STRUCTS
// ============================================================================

/// etd-node: Ethereum Classic peer-to-peer sync node.
#[derive(Parser, Debug, Default)]
#[command(name = "etd-node", version = "0.1.0")]
pub struct Cli {
    /// Path to TOML configuration file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Network to join (mainnet, mordor, dev).
    #[arg(long)]
    pub network: Option<String>,

    /// Path to directory for node key and local data.
    #[arg(long = "datadir")]
    pub datadir: Option<PathBuf>,

    /// Blockchain sync mode (full, fast).
    #[arg(long = "syncmode")]
    pub syncmode: Option<String>,

    /// Checkpoint every peer must agree with, as <number>=<hash>.
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Comma-separated list of pinned blocks, as <number>=<hash>.
    #[arg(long, value_delimiter = ',')]
    pub whitelist: Vec<String>,

    /// Comma-separated enrtree:// URLs for etd dial candidates.
    #[arg(long = "discovery-dns", value_delimiter = ',')]
    pub discovery_dns: Vec<String>,

    /// Comma-separated enrtree:// URLs for snap dial candidates.
    #[arg(long = "snap-discovery-dns", value_delimiter = ',')]
    pub snap_discovery_dns: Vec<String>,

    /// Advertise the snap protocol.
    #[arg(long)]
    pub snapshot: bool,

    /// Maximum number of network peers.
    #[arg(long = "maxpeers")]
    pub max_peers: Option<usize>,

    /// Peer slots reserved for light clients when serving them.
    #[arg(long = "light-peers")]
    pub light_peers: Option<usize>,

    /// Share of time allowed for serving light clients, in percent. Zero disables.
    #[arg(long = "light-serve")]
    pub light_serve: Option<u32>,

    /// Address credited with mined blocks.
    #[arg(long)]
    pub etherbase: Option<String>,

    /// Comma-separated accounts whose blocks and transactions count as local.
    #[arg(long = "txpool-locals", value_delimiter = ',')]
    pub txpool_locals: Vec<String>,

    /// Start mining once the node is up.
    #[arg(long)]
    pub mining: bool,

    /// Number of mining threads. Zero lets the engine decide.
    #[arg(long = "miner-threads")]
    pub miner_threads: Option<i32>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

// ============================================================================
// CONFIG FILE STRUCTS
// ============================================================================

/// Configuration loaded from TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub network: Option<String>,
    pub datadir: Option<String>,
    pub syncmode: Option<String>,
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub discovery_dns: Vec<String>,
    #[serde(default)]
    pub snap_discovery_dns: Vec<String>,
    pub snapshot: Option<bool>,
    pub max_peers: Option<usize>,
    pub light_peers: Option<usize>,
    pub light_serve: Option<u32>,
    pub etherbase: Option<String>,
    #[serde(default)]
    pub txpool_locals: Vec<String>,
    pub mining: Option<bool>,
    pub miner_threads: Option<i32>,
    pub log_level: Option<String>,
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_LIGHT_PEERS: usize = 10;

/// Final merged configuration for runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub network: Network,
    pub datadir: PathBuf,
    pub sync_mode: SyncMode,
    pub checkpoint: Option<Checkpoint>,
    pub whitelist: Whitelist,
    pub discovery_dns: Vec<String>,
    pub snap_discovery_dns: Vec<String>,
    pub snapshot: bool,
    pub max_peers: usize,
    pub light_peers: usize,
    pub light_serve: u32,
    pub etherbase: Option<Address>,
    pub txpool_locals: Vec<Address>,
    pub mining: bool,
    pub miner_threads: i32,
    pub log_level: String,
}

impl RuntimeConfig {
    /// Merge CLI args with config file. Precedence: CLI > config file > defaults.
    pub fn from_cli_and_file(cli: &Cli, file: ConfigFile) -> Result<Self, ConfigError> {
        let network = match cli.network.clone().or(file.network) {
            Some(name) => name.parse()?,
            None => Network::Mainnet,
        };

        let datadir = cli
            .datadir
            .clone()
            .or_else(|| file.datadir.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data"));

        let sync_mode = match cli.syncmode.clone().or(file.syncmode) {
            Some(mode) => mode.parse()?,
            None => SyncMode::default(),
        };

        let checkpoint = cli
            .checkpoint
            .clone()
            .or(file.checkpoint)
            .map(|c| c.parse::<Checkpoint>())
            .transpose()?;

        let whitelist = if !cli.whitelist.is_empty() {
            Whitelist::parse(&cli.whitelist)?
        } else {
            Whitelist::parse(&file.whitelist)?
        };

        let discovery_dns = prefer_cli(&cli.discovery_dns, file.discovery_dns);
        let snap_discovery_dns = prefer_cli(&cli.snap_discovery_dns, file.snap_discovery_dns);

        let snapshot = cli.snapshot || file.snapshot.unwrap_or(false);

        let max_peers = cli.max_peers.or(file.max_peers).unwrap_or(DEFAULT_MAX_PEERS);
        let light_peers = cli
            .light_peers
            .or(file.light_peers)
            .unwrap_or(DEFAULT_LIGHT_PEERS);
        let light_serve = cli.light_serve.or(file.light_serve).unwrap_or(0);

        let etherbase = cli
            .etherbase
            .clone()
            .or(file.etherbase)
            .map(|a| parse_address(&a))
            .transpose()?;

        let txpool_locals = prefer_cli(&cli.txpool_locals, file.txpool_locals)
            .iter()
            .map(|a| parse_address(a))
            .collect::<Result<_, _>>()?;

        let mining = cli.mining || file.mining.unwrap_or(false);
        let miner_threads = cli.miner_threads.or(file.miner_threads).unwrap_or(0);

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        let config = RuntimeConfig {
            network,
            datadir,
            sync_mode,
            checkpoint,
            whitelist,
            discovery_dns,
            snap_discovery_dns,
            snapshot,
            max_peers,
            light_peers,
            light_serve,
            etherbase,
            txpool_locals,
            mining,
            miner_threads,
            log_level,
        };
        config.etd_peers()?;
        Ok(config)
    }

    /// Peer slots left for full `etd` peers once light clients are served.
    pub fn etd_peers(&self) -> Result<usize, ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::NoPeers);
        }
        if self.light_serve == 0 {
            return Ok(self.max_peers);
        }
        if self.light_peers >= self.max_peers {
            return Err(ConfigError::PeerLimits {
                light: self.light_peers,
                max: self.max_peers,
            });
        }
        Ok(self.max_peers - self.light_peers)
    }
}

fn prefer_cli(cli: &[String], file: Vec<String>) -> Vec<String> {
    if !cli.is_empty() {
        cli.to_vec()
    } else {
        file
    }
}

fn parse_address(s: &str) -> Result<Address, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Network(#[from] UnknownNetwork),
    #[error(transparent)]
    Sync(#[from] sync::ConfigError),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("--maxpeers must be positive")]
    NoPeers,
    #[error("invalid peer config: light peer count ({light}) >= total peer count ({max})")]
    PeerLimits { light: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

// ============================================================================
// LOADING FUNCTIONS
// ============================================================================

/// Load TOML config file, returns default if path is None.
pub fn load_config_file(path: Option<&PathBuf>) -> Result<ConfigFile, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)?;
            toml::from_str(&content).map_err(ConfigError::Toml)
        }
        None => Ok(ConfigFile::default()),
    }
}
