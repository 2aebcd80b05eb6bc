use anyhow::Context;
use async_trait::async_trait;
use consensus::ConsensusNetwork;
use futures::future::join_all;
use runtime::{node_id_for_port, Block, BlockFields, Timestamp};
use serde::{Deserialize, Serialize};
use state::NodeId;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_PEERS: [&str; 2] = ["127.0.0.1:5001", "127.0.0.1:5002"];

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid peer address {0:?}")]
    InvalidPeer(String),
    #[error("reading peers from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn parse(line: &str) -> Result<Self, NetworkError> {
        let line = line.trim();
        let (host, port) = line
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::InvalidPeer(line.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| NetworkError::InvalidPeer(line.to_string()))?;
        if host.is_empty() {
            return Err(NetworkError::InvalidPeer(line.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn node_id(&self) -> NodeId {
        node_id_for_port(self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// Static peer list. Fixed at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerBook {
    peers: Vec<Peer>,
}

impl PeerBook {
    /// One `host:port` per line. Blank lines and `#` comments are skipped,
    /// as is `self_addr`.
    pub fn parse(contents: &str, self_addr: &str) -> Result<Self, NetworkError> {
        let mut peers: Vec<Peer> = Vec::new();
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line == self_addr {
                continue;
            }
            let peer = Peer::parse(line)?;
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        Ok(Self { peers })
    }

    /// Falls back to [`DEFAULT_PEERS`] when the file is missing.
    pub fn load(path: impl AsRef<Path>, self_addr: &str) -> Result<Self, NetworkError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => {
                let book = Self::parse(&contents, self_addr)?;
                info!(path = %path.display(), peers = book.len(), "loaded peers");
                Ok(book)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "peers file missing, using default peers");
                Ok(Self::defaults(self_addr))
            }
            Err(source) => Err(NetworkError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn defaults(self_addr: &str) -> Self {
        let contents = DEFAULT_PEERS.join("\n");
        Self::parse(&contents, self_addr).unwrap_or_default()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(Peer::node_id).collect()
    }

    pub fn find(&self, node_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.node_id() == node_id)
    }
}

/// Body of `POST /select_node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionNotice {
    pub consensus_id: Option<String>,
    pub stop_time: Timestamp,
}

/// Body of `POST /vote_on_block`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub block: BlockFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote: bool,
}

/// Body of `POST /receive_block`: the block fields plus the node credited
/// with producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockAnnouncement {
    #[serde(flatten)]
    pub fields: BlockFields,
    pub consensus_node: String,
}

impl BlockAnnouncement {
    pub fn new(block: &Block, proposer: &str) -> Self {
        Self {
            fields: block.fields(),
            consensus_node: proposer.to_string(),
        }
    }
}

/// Talks to peers over the node's own HTTP routes.
#[derive(Clone)]
pub struct HttpConsensusNetwork {
    client: reqwest::Client,
    peers: PeerBook,
}

impl HttpConsensusNetwork {
    pub fn new(peers: PeerBook, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building peer http client")?;
        Ok(Self { client, peers })
    }

    pub fn peers(&self) -> &PeerBook {
        &self.peers
    }

    async fn post_all<T: Serialize + Sync>(&self, path: &str, body: &T) {
        let sends = self.peers.peers().iter().map(|peer| async move {
            let url = peer.url(path);
            match self.client.post(&url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => debug!(%url, "peer accepted"),
                Ok(resp) => warn!(%url, status = %resp.status(), "peer refused"),
                Err(err) => warn!(%url, error = %err, "peer unreachable"),
            }
        });
        join_all(sends).await;
    }
}

#[async_trait]
impl ConsensusNetwork for HttpConsensusNetwork {
    async fn announce_selection(&self, node_id: &str, found_at: Timestamp) {
        let notice = SelectionNotice {
            consensus_id: Some(node_id.to_string()),
            stop_time: found_at,
        };
        self.post_all("/select_node", &notice).await;
    }

    async fn request_vote(&self, peer: &str, candidate: &BlockFields) -> anyhow::Result<bool> {
        let target = self
            .peers
            .find(peer)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;
        let response: VoteResponse = self
            .client
            .post(target.url("/vote_on_block"))
            .json(&VoteRequest {
                block: candidate.clone(),
            })
            .send()
            .await
            .with_context(|| format!("sending vote request to {peer}"))?
            .error_for_status()?
            .json()
            .await
            .context("decoding vote")?;
        Ok(response.vote)
    }

    async fn broadcast_block(&self, block: &Block, proposer: &str) {
        self.post_all("/receive_block", &BlockAnnouncement::new(block, proposer))
            .await;
    }
}
