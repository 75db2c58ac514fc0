//! Simulation configuration.
//!
//! Options come from the command line, from `RINGSIM_*` environment variables
//! and from a TOML file (`--config <path>`, or `ringsim.toml` in the working
//! directory). Command line and environment take precedence over the file.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{errors::SimulationError, node::NodeParams};

pub const DEFAULT_SIZE: usize = 16;
pub const DEFAULT_BASE_LATENCY_MS: u64 = 10;
pub const DEFAULT_MAX_WAIT_SECS: u64 = 3600;
pub const DEFAULT_QUIESCENCE_MS: u64 = 1000;
pub const DEFAULT_STABILIZE_MS: u64 = 1000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_AUTHORITY_KEY_BITS: usize = 2048;
pub const DEFAULT_DHT_DEGREE: u32 = 3;
pub const MAX_DHT_DEGREE: u32 = 8;
const DEFAULT_CONFIG_FILE: &str = "ringsim.toml";

#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
#[command(name = "ringsim", version, about = "Discrete-event simulator for a structured ring overlay")]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulationArgs {
    /// TOML file holding defaults for any of the options below.
    #[arg(long, env = "RINGSIM_CONFIG")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Number of nodes to start.
    #[arg(long, short = 'n', env = "RINGSIM_SIZE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,

    /// Seed for every random draw. A random seed is picked and logged when absent.
    #[arg(long, short, env = "RINGSIM_SEED")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Edges must present a certificate signed by the simulation authority.
    #[arg(long, env = "RINGSIM_SECURE_EDGES")]
    pub secure_edges: bool,

    /// Enable security associations for secure senders.
    #[arg(long, env = "RINGSIM_SECURE_SENDERS")]
    pub secure_senders: bool,

    /// Use the three-stage handshake instead of the symmetric one.
    #[arg(long, env = "RINGSIM_DTLS")]
    pub dtls: bool,

    /// Multiplex node endpoints over transport paths.
    #[arg(long, env = "RINGSIM_PATHING")]
    pub pathing: bool,

    /// Probability that a direct link between two nodes is denied.
    #[arg(long, env = "RINGSIM_BROKEN")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken: Option<f64>,

    /// Run network coordinates on every node.
    #[arg(long, env = "RINGSIM_NC")]
    pub nc_enable: bool,

    /// Seed each node with its ring neighbors instead of random peers.
    #[arg(long, env = "RINGSIM_EVALUATION")]
    pub evaluation: bool,

    /// File receiving one `<node>, <hops>` line per broadcast receiver.
    #[arg(long, short, env = "RINGSIM_OUTPUT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,

    /// Run a broadcast with this many forwarders per hop, -1 for all.
    #[arg(long, env = "RINGSIM_BROADCAST", allow_negative_numbers = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<i64>,

    /// JSON matrix of one-way latencies in milliseconds.
    #[arg(long, env = "RINGSIM_LATENCY_MAP")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_map: Option<PathBuf>,

    #[arg(long, env = "RINGSIM_BASE_LATENCY_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_latency_ms: Option<u64>,

    /// Simulated time budget for each wait on the network.
    #[arg(long, env = "RINGSIM_MAX_WAIT_SECS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_secs: Option<u64>,

    /// Quiet period after which a broadcast is considered finished.
    #[arg(long, env = "RINGSIM_QUIESCENCE_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiescence_ms: Option<u64>,

    #[arg(long, env = "RINGSIM_STABILIZE_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stabilize_ms: Option<u64>,

    #[arg(long, env = "RINGSIM_RPC_TIMEOUT_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_timeout_ms: Option<u64>,

    #[arg(long, env = "RINGSIM_AUTHORITY_KEY_BITS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_key_bits: Option<usize>,

    /// Each key is stored on 2^degree replicas.
    #[arg(long, env = "RINGSIM_DHT_DEGREE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dht_degree: Option<u32>,

    /// Crawl the ring after it formed.
    #[arg(long, env = "RINGSIM_CRAWL")]
    pub crawl: bool,

    /// Ping between every pair of nodes after the ring formed.
    #[arg(long, env = "RINGSIM_ALL_TO_ALL")]
    pub all_to_all: bool,

    /// Dump connection tables when a wait fails.
    #[arg(long, short, env = "RINGSIM_VERBOSE")]
    pub verbose: bool,

    #[arg(long, env = "RINGSIM_LOG_LEVEL")]
    #[serde(skip)]
    pub log_level: Option<tracing::level_filters::LevelFilter>,
}

impl SimulationArgs {
    /// Merges in the configuration file, if any, and validates the result.
    pub fn build(self) -> anyhow::Result<SimulationConfig> {
        let file = match &self.config {
            Some(path) => Some(Self::read_config(path)?),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    tracing::debug!(path = %default.display(), "Found configuration file");
                    Some(Self::read_config(default)?)
                } else {
                    None
                }
            }
        };
        let merged = match file {
            Some(file) => self.merge(file),
            None => self,
        };
        Ok(SimulationConfig::try_from(merged)?)
    }

    pub fn read_config(path: &Path) -> anyhow::Result<SimulationArgs> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing configuration file {}", path.display()))
    }

    fn merge(self, file: SimulationArgs) -> SimulationArgs {
        SimulationArgs {
            config: self.config,
            size: self.size.or(file.size),
            seed: self.seed.or(file.seed),
            secure_edges: self.secure_edges || file.secure_edges,
            secure_senders: self.secure_senders || file.secure_senders,
            dtls: self.dtls || file.dtls,
            pathing: self.pathing || file.pathing,
            broken: self.broken.or(file.broken),
            nc_enable: self.nc_enable || file.nc_enable,
            evaluation: self.evaluation || file.evaluation,
            output: self.output.or(file.output),
            broadcast: self.broadcast.or(file.broadcast),
            latency_map: self.latency_map.or(file.latency_map),
            base_latency_ms: self.base_latency_ms.or(file.base_latency_ms),
            max_wait_secs: self.max_wait_secs.or(file.max_wait_secs),
            quiescence_ms: self.quiescence_ms.or(file.quiescence_ms),
            stabilize_ms: self.stabilize_ms.or(file.stabilize_ms),
            rpc_timeout_ms: self.rpc_timeout_ms.or(file.rpc_timeout_ms),
            authority_key_bits: self.authority_key_bits.or(file.authority_key_bits),
            dht_degree: self.dht_degree.or(file.dht_degree),
            crawl: self.crawl || file.crawl,
            all_to_all: self.all_to_all || file.all_to_all,
            verbose: self.verbose || file.verbose,
            log_level: self.log_level,
        }
    }
}

/// Fan-out of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fanout {
    All,
    Limited(usize),
}

impl Fanout {
    pub fn limit(self) -> Option<usize> {
        match self {
            Fanout::All => None,
            Fanout::Limited(n) => Some(n),
        }
    }
}

impl TryFrom<i64> for Fanout {
    type Error = SimulationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Fanout::All),
            n if n > 0 => Ok(Fanout::Limited(n as usize)),
            n => Err(SimulationError::Config(format!(
                "broadcast forwarders must be positive or -1, got {n}"
            ))),
        }
    }
}

/// Validated simulation configuration. The seed is always concrete, so a run
/// can be repeated from its recorded configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub size: usize,
    pub seed: u64,
    pub secure_edges: bool,
    pub secure_senders: bool,
    pub dtls: bool,
    pub pathing: bool,
    pub broken: f64,
    pub nc_enable: bool,
    pub evaluation: bool,
    pub output: Option<PathBuf>,
    pub broadcast: Option<Fanout>,
    pub latency_map: Option<PathBuf>,
    pub base_latency: Duration,
    pub max_wait: Duration,
    pub quiescence: Duration,
    pub stabilize_interval: Duration,
    pub rpc_timeout: Duration,
    pub authority_key_bits: usize,
    pub dht_degree: u32,
    pub crawl: bool,
    pub all_to_all: bool,
    pub verbose: bool,
}

impl SimulationConfig {
    pub fn new(size: usize, seed: u64) -> Self {
        Self {
            size,
            seed,
            secure_edges: false,
            secure_senders: false,
            dtls: false,
            pathing: false,
            broken: 0.0,
            nc_enable: false,
            evaluation: false,
            output: None,
            broadcast: None,
            latency_map: None,
            base_latency: Duration::from_millis(DEFAULT_BASE_LATENCY_MS),
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            quiescence: Duration::from_millis(DEFAULT_QUIESCENCE_MS),
            stabilize_interval: Duration::from_millis(DEFAULT_STABILIZE_MS),
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            authority_key_bits: DEFAULT_AUTHORITY_KEY_BITS,
            dht_degree: DEFAULT_DHT_DEGREE,
            crawl: false,
            all_to_all: false,
            verbose: false,
        }
    }

    /// Whether nodes need certificates.
    pub fn is_secure(&self) -> bool {
        self.secure_edges || self.secure_senders
    }

    pub fn node_params(&self) -> NodeParams {
        NodeParams {
            stabilize_interval: self.stabilize_interval,
            rpc_timeout: self.rpc_timeout,
            link_timeout: self.rpc_timeout,
            near_per_side: 2,
            dht_degree: self.dht_degree,
        }
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if !(0.0..=1.0).contains(&self.broken) {
            return Err(SimulationError::Config(format!(
                "broken probability must be within [0, 1], got {}",
                self.broken
            )));
        }
        if self.dtls && !self.is_secure() {
            return Err(SimulationError::Config(
                "dtls needs secure edges or secure senders".into(),
            ));
        }
        if self.dht_degree > MAX_DHT_DEGREE {
            return Err(SimulationError::Config(format!(
                "dht degree must be at most {MAX_DHT_DEGREE}"
            )));
        }
        if self.is_secure() && self.authority_key_bits < 512 {
            return Err(SimulationError::Config(
                "authority key needs at least 512 bits".into(),
            ));
        }
        if self.quiescence.is_zero() || self.stabilize_interval.is_zero() || self.rpc_timeout.is_zero() {
            return Err(SimulationError::Config(
                "quiescence, stabilize and rpc timeout periods must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<SimulationArgs> for SimulationConfig {
    type Error = SimulationError;

    fn try_from(args: SimulationArgs) -> Result<Self, Self::Error> {
        let size = args.size.unwrap_or(DEFAULT_SIZE);
        if size == 0 {
            return Err(SimulationError::Config("size must be positive".into()));
        }
        let seed = args.seed.unwrap_or_else(|| {
            let seed = rand::random();
            tracing::info!(seed, "No seed given, picked one");
            seed
        });
        let broadcast = args.broadcast.map(Fanout::try_from).transpose()?;
        let config = SimulationConfig {
            secure_edges: args.secure_edges,
            secure_senders: args.secure_senders,
            dtls: args.dtls,
            pathing: args.pathing,
            broken: args.broken.unwrap_or(0.0),
            nc_enable: args.nc_enable,
            evaluation: args.evaluation,
            output: args.output,
            broadcast,
            latency_map: args.latency_map,
            base_latency: Duration::from_millis(
                args.base_latency_ms.unwrap_or(DEFAULT_BASE_LATENCY_MS),
            ),
            max_wait: Duration::from_secs(args.max_wait_secs.unwrap_or(DEFAULT_MAX_WAIT_SECS)),
            quiescence: Duration::from_millis(args.quiescence_ms.unwrap_or(DEFAULT_QUIESCENCE_MS)),
            stabilize_interval: Duration::from_millis(
                args.stabilize_ms.unwrap_or(DEFAULT_STABILIZE_MS),
            ),
            rpc_timeout: Duration::from_millis(
                args.rpc_timeout_ms.unwrap_or(DEFAULT_RPC_TIMEOUT_MS),
            ),
            authority_key_bits: args
                .authority_key_bits
                .unwrap_or(DEFAULT_AUTHORITY_KEY_BITS),
            dht_degree: args.dht_degree.unwrap_or(DEFAULT_DHT_DEGREE),
            crawl: args.crawl,
            all_to_all: args.all_to_all,
            verbose: args.verbose,
            ..SimulationConfig::new(size, seed)
        };
        config.validate()?;
        Ok(config)
    }
}

pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}
