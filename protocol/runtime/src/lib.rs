use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

mod chain;
pub mod config;

pub use chain::{BlockMetrics, Chain, ChainMetrics, CommitObserver, TracingObserver};
pub use config::{ConfigError, ConsensusKind, ConsensusParams, NodeConfig, ZkSettings};

/// Seconds since the Unix epoch, fractional.
pub type Timestamp = f64;

pub const GENESIS_USER: &str = "genesis";
pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const GENESIS_NONCE: u64 = 0;
pub const GENESIS_TIMESTAMP: Timestamp = 1.0;

/// Every field of a block except its hash. This is what gets hashed and what
/// peers exchange when asking for a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFields {
    pub user_id: String,
    pub previous_hash: String,
    #[serde(default)]
    pub transaction: Value,
    #[serde(default)]
    pub commitment: Value,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub user_id: String,
    pub previous_hash: String,
    pub transaction: Value,
    pub commitment: Value,
    pub timestamp: Timestamp,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    pub hash: String,
}

impl BlockFields {
    pub fn seal(self) -> Block {
        let hash = hash_fields(&self);
        Block {
            user_id: self.user_id,
            previous_hash: self.previous_hash,
            transaction: self.transaction,
            commitment: self.commitment,
            timestamp: self.timestamp,
            nonce: self.nonce,
            validator: self.validator,
            hash,
        }
    }
}

impl Block {
    pub fn fields(&self) -> BlockFields {
        BlockFields {
            user_id: self.user_id.clone(),
            previous_hash: self.previous_hash.clone(),
            transaction: self.transaction.clone(),
            commitment: self.commitment.clone(),
            timestamp: self.timestamp,
            nonce: self.nonce,
            validator: self.validator.clone(),
        }
    }

    pub fn recompute_hash(&self) -> String {
        hash_fields(&self.fields())
    }

    pub fn has_valid_hash(&self) -> bool {
        self.recompute_hash() == self.hash
    }

    /// Serialized size of the full block, hash included.
    pub fn size_in_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }

    /// A merged batch of pending transactions counts per entry.
    pub fn transaction_count(&self) -> usize {
        match &self.transaction {
            Value::Array(items) => items.len(),
            _ => 1,
        }
    }
}

pub fn genesis_block() -> Block {
    BlockFields {
        user_id: GENESIS_USER.into(),
        previous_hash: GENESIS_PREVIOUS_HASH.into(),
        transaction: Value::String("Genesis Block".into()),
        commitment: Value::String("genesis_commitment".into()),
        timestamp: GENESIS_TIMESTAMP,
        nonce: GENESIS_NONCE,
        validator: None,
    }
    .seal()
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_encoding(fields: &BlockFields) -> Vec<u8> {
    let value = serde_json::to_value(fields).unwrap_or(Value::Null);
    serde_json::to_vec(&sorted(value)).unwrap_or_default()
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k, sorted(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

pub fn hash_fields(fields: &BlockFields) -> String {
    let digest = Sha256::digest(canonical_encoding(fields));
    hex::encode(digest)
}

/// True when the hex hash starts with `difficulty` zero digits.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

pub fn now_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Peer node ids are derived from the port they listen on.
pub fn node_id_for_port(port: u16) -> String {
    format!("node_{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn genesis_hash_is_stable() {
        let a = genesis_block();
        let b = genesis_block();
        assert_eq!(a.hash, b.hash);
        assert!(a.has_valid_hash());
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn key_order_does_not_change_the_hash() {
        let mut fields = genesis_block().fields();
        fields.transaction = json!({"b": 1, "a": {"z": true, "c": [3, {"y": 0, "x": 1}]}});
        let first = hash_fields(&fields);
        fields.transaction = json!({"a": {"c": [3, {"x": 1, "y": 0}], "z": true}, "b": 1});
        assert_eq!(first, hash_fields(&fields));
    }

    #[test]
    fn encoding_is_sorted_and_omits_missing_validator() {
        let bytes = canonical_encoding(&genesis_block().fields());
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\"commitment\""));
        assert!(!text.contains("validator"));
        let idx = |k: &str| text.find(k).unwrap();
        assert!(idx("\"nonce\"") < idx("\"previous_hash\""));
        assert!(idx("\"timestamp\"") < idx("\"user_id\""));
    }

    #[test]
    fn validator_participates_in_the_hash() {
        let mut fields = genesis_block().fields();
        let plain = hash_fields(&fields);
        fields.validator = Some("node1".into());
        assert_ne!(plain, hash_fields(&fields));
    }

    #[test]
    fn difficulty_prefix() {
        assert!(meets_difficulty("000abc", 3));
        assert!(!meets_difficulty("00a0bc", 3));
        assert!(meets_difficulty("abc", 0));
        assert!(!meets_difficulty("00", 3));
    }

    #[test]
    fn transaction_count_counts_batches() {
        let mut block = genesis_block();
        assert_eq!(block.transaction_count(), 1);
        block.transaction = json!([{"a": 1}, {"b": 2}, 3]);
        assert_eq!(block.transaction_count(), 3);
    }
}
