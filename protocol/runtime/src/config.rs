//! Node configuration: an optional YAML file overlaid with environment
//! variables. Consensus selection happens here, once, at startup.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown consensus strategy: {0}")]
    UnknownConsensus(String),
    #[error("proof-of-authority requires at least one authority")]
    MissingAuthorities,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConsensusKind {
    ProofOfWork,
    ProofOfStake,
    ProofOfAuthority,
    Hierarchical,
}

impl FromStr for ConsensusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pow" | "powconsensus" | "proof-of-work" => Ok(Self::ProofOfWork),
            "pos" | "posconsensus" | "proof-of-stake" => Ok(Self::ProofOfStake),
            "poa" | "poaconsensus" | "proof-of-authority" => Ok(Self::ProofOfAuthority),
            "hrbc" | "hierarchical" => Ok(Self::Hierarchical),
            _ => Err(ConfigError::UnknownConsensus(s.to_string())),
        }
    }
}

impl TryFrom<String> for ConsensusKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConsensusKind> for String {
    fn from(kind: ConsensusKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProofOfWork => "pow",
            Self::ProofOfStake => "pos",
            Self::ProofOfAuthority => "poa",
            Self::Hierarchical => "hrbc",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub difficulty: u32,
    pub reward: f64,
    pub penalty: f64,
    pub decay_rate: f64,
    pub cluster_count: usize,
    pub authorities: Vec<String>,
    /// Upper bound on nonce attempts per round; unbounded when absent.
    pub max_attempts: Option<u64>,
    pub vote_timeout_ms: u64,
    /// Seeds the synthetic node properties so every node forms the same
    /// clusters.
    pub cluster_seed: u64,
    /// Fixed starting score for every known node. When absent, scores are
    /// drawn from `reputation_range` using `reputation_seed`.
    pub initial_reputation: Option<f64>,
    pub reputation_seed: u64,
    pub reputation_range: (f64, f64),
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            difficulty: 4,
            reward: 10.0,
            penalty: 20.0,
            decay_rate: 0.01,
            cluster_count: 3,
            authorities: vec!["node_5000".into(), "node_5001".into()],
            max_attempts: None,
            vote_timeout_ms: 5_000,
            cluster_seed: 7,
            initial_reputation: None,
            reputation_seed: 42,
            reputation_range: (50.0, 100.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkSettings {
    pub p: u64,
    pub g: u64,
    pub token_secret: String,
    pub token_ttl_secs: i64,
}

impl Default for ZkSettings {
    fn default() -> Self {
        Self {
            p: 29,
            g: 5,
            token_secret: "secret-key-for-tokens".into(),
            token_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub consensus: ConsensusKind,
    pub params: ConsensusParams,
    pub zk: ZkSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            data_dir: PathBuf::from("node_data/node_5000"),
            consensus: ConsensusKind::Hierarchical,
            params: ConsensusParams::default(),
            zk: ZkSettings::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// `CONFIG_PATH` (YAML) when set, then individual environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("CONFIG_PATH") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("NODE_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("NODE_PORT") {
            self.port = parse_value("NODE_PORT", &v)?;
            if lookup("DATA_DIR").is_none() {
                self.data_dir = PathBuf::from(format!("node_data/node_{}", self.port));
            }
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CONSENSUS") {
            self.consensus = v.parse()?;
        }
        if let Some(v) = lookup("DIFFICULTY") {
            self.params.difficulty = parse_value("DIFFICULTY", &v)?;
        }
        if let Some(v) = lookup("AUTHORITIES") {
            self.params.authorities = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("VOTE_TIMEOUT_MS") {
            self.params.vote_timeout_ms = parse_value("VOTE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ZK_P") {
            self.zk.p = parse_value("ZK_P", &v)?;
        }
        if let Some(v) = lookup("ZK_G") {
            self.zk.g = parse_value("ZK_G", &v)?;
        }
        if let Some(v) = lookup("TOKEN_SECRET") {
            self.zk.token_secret = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus == ConsensusKind::ProofOfAuthority && self.params.authorities.is_empty() {
            return Err(ConfigError::MissingAuthorities);
        }
        if self.params.difficulty > 64 {
            return Err(ConfigError::InvalidValue {
                key: "difficulty",
                value: self.params.difficulty.to_string(),
            });
        }
        if self.params.cluster_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cluster_count",
                value: "0".into(),
            });
        }
        if self.zk.p < 5 || self.zk.g < 2 || self.zk.g >= self.zk.p {
            return Err(ConfigError::InvalidValue {
                key: "zk",
                value: format!("p={} g={}", self.zk.p, self.zk.g),
            });
        }
        Ok(())
    }

    pub fn node_id(&self) -> String {
        crate::node_id_for_port(self.port)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn peers_file(&self) -> PathBuf {
        self.data_dir.join("peers.txt")
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
