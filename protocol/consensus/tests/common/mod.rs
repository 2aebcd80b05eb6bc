#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use consensus::{ConsensusNetwork, EngineContext};
use runtime::{Block, BlockFields, ConsensusParams, Timestamp};
use state::ReputationTable;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Peers answer votes from a fixed script; anything unscripted is a
/// transport failure.
#[derive(Default)]
pub struct ScriptedNetwork {
    votes: HashMap<String, bool>,
    pub announcements: Mutex<Vec<(String, Timestamp)>>,
    pub vote_requests: Mutex<Vec<String>>,
    pub broadcasts: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    pub fn with_votes(votes: &[(&str, bool)]) -> Arc<Self> {
        Arc::new(Self {
            votes: votes.iter().map(|(p, v)| (p.to_string(), *v)).collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ConsensusNetwork for ScriptedNetwork {
    async fn announce_selection(&self, node_id: &str, found_at: Timestamp) {
        self.announcements
            .lock()
            .unwrap()
            .push((node_id.to_string(), found_at));
    }

    async fn request_vote(&self, peer: &str, _candidate: &BlockFields) -> Result<bool> {
        self.vote_requests.lock().unwrap().push(peer.to_string());
        self.votes
            .get(peer)
            .copied()
            .ok_or_else(|| anyhow!("{peer} unreachable"))
    }

    async fn broadcast_block(&self, block: &Block, _proposer: &str) {
        self.broadcasts.lock().unwrap().push(block.hash.clone());
    }
}

pub fn params(difficulty: u32) -> ConsensusParams {
    ConsensusParams {
        difficulty,
        vote_timeout_ms: 500,
        ..ConsensusParams::default()
    }
}

pub fn context(
    node_id: &str,
    reputation: &ReputationTable,
    network: Arc<dyn ConsensusNetwork>,
    params: ConsensusParams,
) -> EngineContext {
    EngineContext {
        node_id: node_id.to_string(),
        reputation: reputation.clone(),
        network,
        params,
    }
}
