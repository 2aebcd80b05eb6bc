use anyhow::Context;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use consensus::{build_engine, ConsensusNetwork, EngineContext, Ledger, LedgerError};
use networking::{
    BlockAnnouncement, HttpConsensusNetwork, PeerBook, SelectionNotice, VoteRequest, VoteResponse,
};
use runtime::NodeConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use state::{NodeId, ReputationTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use zk_core::{Authenticator, SessionIssuer, ZkError, ZkParams};

type Reply = (StatusCode, Json<Value>);

#[derive(Clone)]
struct Node {
    id: NodeId,
    ledger: Arc<Ledger>,
    auth: Arc<Authenticator>,
    network: Arc<dyn ConsensusNetwork>,
    reputation: ReputationTable,
    peer_count: usize,
}

#[derive(Debug, Deserialize)]
struct AddBlockRequest {
    user_id: String,
    #[serde(default)]
    transaction: Value,
    #[serde(default)]
    commitment: Value,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "hashedPassword")]
    hashed_password: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InitiateRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "T")]
    commitment: u64,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(rename = "userId")]
    user_id: String,
    s: u64,
    challenge: u64,
}

#[derive(Debug, Deserialize)]
struct AuthenticateRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default)]
    tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueueRequest {
    transaction: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = NodeConfig::load().context("loading node configuration")?;
    info!(
        "swarm ledger node starting ({}, consensus {})",
        config.node_id(),
        config.consensus
    );

    let peers = PeerBook::load(config.peers_file(), &config.listen_addr())
        .context("loading peer list")?;
    let network = Arc::new(HttpConsensusNetwork::new(
        peers.clone(),
        Duration::from_millis(config.params.vote_timeout_ms),
    )?);
    let node = create_node(&config, &peers, network)?;

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr()))?;
    info!("HTTP listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app(node).into_make_service()).await?;
    Ok(())
}

fn create_node(
    config: &NodeConfig,
    peers: &PeerBook,
    network: Arc<dyn ConsensusNetwork>,
) -> anyhow::Result<Node> {
    let id = config.node_id();
    let mut known: Vec<NodeId> = peers
        .node_ids()
        .into_iter()
        .filter(|peer| *peer != id)
        .collect();
    let peer_count = known.len();
    known.push(id.clone());

    let reputation = match config.params.initial_reputation {
        Some(score) => ReputationTable::uniform(known, score),
        None => ReputationTable::seeded(
            known,
            config.params.reputation_seed,
            config.params.reputation_range,
        ),
    };
    let engine = build_engine(
        config.consensus,
        EngineContext {
            node_id: id.clone(),
            reputation: reputation.clone(),
            network: network.clone(),
            params: config.params.clone(),
        },
    )?;
    let ledger = Arc::new(Ledger::new(engine));

    let params = ZkParams::new(config.zk.p, config.zk.g)?;
    let issuer = SessionIssuer::new(&config.zk.token_secret, config.zk.token_ttl_secs);
    let auth = Arc::new(Authenticator::new(id.clone(), params, issuer));

    info!(node = %id, peers = peer_count, "node ready");
    Ok(Node {
        id,
        ledger,
        auth,
        network,
        reputation,
        peer_count,
    })
}

fn app(node: Node) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/sync_blockchain",
            get({
                let node = node.clone();
                move || {
                    let node = node.clone();
                    async move { Json(node.ledger.blocks()) }
                }
            }),
        )
        .route(
            "/metrics",
            get({
                let node = node.clone();
                move || {
                    let node = node.clone();
                    async move { Json(node.ledger.metrics()) }
                }
            }),
        )
        .route(
            "/add_block",
            post({
                let node = node.clone();
                move |Json(body): Json<AddBlockRequest>| {
                    let node = node.clone();
                    async move { add_block(&node, body).await }
                }
            }),
        )
        .route(
            "/receive_block",
            post({
                let node = node.clone();
                move |Json(body): Json<BlockAnnouncement>| {
                    let node = node.clone();
                    async move { receive_block(&node, body) }
                }
            }),
        )
        .route(
            "/vote_on_block",
            post({
                let node = node.clone();
                move |Json(body): Json<VoteRequest>| {
                    let node = node.clone();
                    async move {
                        let vote = node.ledger.approve(body.block);
                        debug!(vote, "vote cast");
                        Json(VoteResponse { vote })
                    }
                }
            }),
        )
        .route(
            "/select_node",
            post({
                let node = node.clone();
                move |Json(body): Json<SelectionNotice>| {
                    let node = node.clone();
                    async move { select_node(&node, body) }
                }
            }),
        )
        .route(
            "/queue_transaction",
            post({
                let node = node.clone();
                move |Json(body): Json<QueueRequest>| {
                    let node = node.clone();
                    async move {
                        let pending = node.ledger.enqueue_transaction(body.transaction);
                        Json(json!({"message": "Transaction queued", "pending": pending}))
                    }
                }
            }),
        )
        .route(
            "/register",
            post({
                let node = node.clone();
                move |Json(body): Json<RegisterRequest>| {
                    let node = node.clone();
                    async move { register(&node, body).await }
                }
            }),
        )
        .route(
            "/initiate_zkp",
            post({
                let node = node.clone();
                move |Json(body): Json<InitiateRequest>| {
                    let node = node.clone();
                    async move {
                        match node.auth.initiate(&body.user_id, body.commitment) {
                            Ok(challenge) => reply(StatusCode::OK, json!({"challenge": challenge})),
                            Err(err) => zk_failure(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/verify_zkp",
            post({
                let node = node.clone();
                move |Json(body): Json<VerifyRequest>| {
                    let node = node.clone();
                    async move {
                        match node.auth.verify(&body.user_id, body.s, body.challenge) {
                            Ok(token) => reply(
                                StatusCode::OK,
                                json!({"message": "Login successful", "token": token}),
                            ),
                            Err(err) => zk_failure(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/authenticate",
            post({
                let node = node.clone();
                move |Json(body): Json<AuthenticateRequest>| {
                    let node = node.clone();
                    async move {
                        let valid = node.auth.count_valid(&body.user_id, &body.tokens);
                        if node.auth.authenticate(&body.user_id, &body.tokens, node.peer_count) {
                            reply(
                                StatusCode::OK,
                                json!({"message": "Authentication successful", "valid_tokens": valid}),
                            )
                        } else {
                            reply(
                                StatusCode::UNAUTHORIZED,
                                json!({"message": "Authentication failed", "valid_tokens": valid}),
                            )
                        }
                    }
                }
            }),
        )
        .route(
            "/process_request",
            post({
                let node = node.clone();
                move |Json(body): Json<AuthenticateRequest>| {
                    let node = node.clone();
                    async move { process_request(&node, body).await }
                }
            }),
        )
}

fn reply(status: StatusCode, body: Value) -> Reply {
    (status, Json(body))
}

async fn add_block(node: &Node, body: AddBlockRequest) -> Reply {
    match node
        .ledger
        .add_block(body.user_id, body.transaction, body.commitment)
        .await
    {
        Ok(committed) => {
            node.network
                .broadcast_block(&committed.block, &committed.proposer)
                .await;
            reply(
                StatusCode::OK,
                json!({
                    "message": "Block added",
                    "block": committed.block,
                    "consensus_node": committed.proposer,
                }),
            )
        }
        Err(err) => {
            warn!(node = %node.id, error = %err, "failed to add block");
            let winner = match &err {
                LedgerError::NotSelected { winner } => winner.clone(),
                _ => None,
            };
            reply(
                StatusCode::BAD_REQUEST,
                json!({"message": format!("Failed to add block: {err}"), "winner": winner}),
            )
        }
    }
}

fn receive_block(node: &Node, body: BlockAnnouncement) -> Reply {
    let proposer = body.consensus_node;
    let block = body.fields.seal();
    match node.ledger.receive_block(block, &proposer) {
        Ok(_) => {
            info!(from = %proposer, height = node.ledger.height(), "block received");
            reply(StatusCode::OK, json!({"message": "Block added successfully"}))
        }
        Err(err) => {
            warn!(from = %proposer, error = %err, "invalid block received");
            reply(
                StatusCode::BAD_REQUEST,
                json!({"message": "Invalid block", "error": err.to_string()}),
            )
        }
    }
}

fn select_node(node: &Node, body: SelectionNotice) -> Reply {
    let Some(winner) = body.consensus_id.filter(|id| !id.is_empty()) else {
        warn!("selection notice without an id");
        return reply(StatusCode::BAD_REQUEST, json!({"error": "No ID provided."}));
    };
    let stopped = node.ledger.cancel(body.stop_time);
    info!(%winner, stop_time = body.stop_time, stopped, "selection notice");
    let message = if stopped {
        "Mining Stopped"
    } else {
        "Mining Continued"
    };
    reply(StatusCode::OK, json!({ "message": message }))
}

async fn register(node: &Node, body: RegisterRequest) -> Reply {
    let (Some(user_id), Some(hashed_password)) = (body.user_id, body.hashed_password) else {
        return reply(StatusCode::BAD_REQUEST, json!({"message": "Invalid input"}));
    };
    if let Err(err) = node.auth.register(&user_id, hashed_password) {
        return reply(StatusCode::BAD_REQUEST, json!({"message": err.to_string()}));
    }

    // The user stays registered even if this node does not win the round.
    let block = record_action(node, &user_id, "register").await;
    reply(
        StatusCode::OK,
        json!({"message": "Registration successful", "block": block}),
    )
}

/// A request backed by a majority token bundle is recorded as a
/// `{"action": "process"}` block and broadcast to peers.
async fn process_request(node: &Node, body: AuthenticateRequest) -> Reply {
    if !node.auth.authenticate(&body.user_id, &body.tokens, node.peer_count) {
        warn!(user = %body.user_id, "request denied");
        return reply(StatusCode::UNAUTHORIZED, json!({"message": "Request denied"}));
    }
    info!(user = %body.user_id, "processing request");
    let block = record_action(node, &body.user_id, "process").await;
    reply(
        StatusCode::OK,
        json!({"message": "Request processed successfully", "block": block}),
    )
}

/// Try to commit and broadcast an `{"action": ..}` block for `user_id`.
/// `None` when this node did not produce it.
async fn record_action(node: &Node, user_id: &str, action: &str) -> Option<runtime::Block> {
    let block = match node
        .ledger
        .add_block(user_id, json!({ "action": action }), Value::Null)
        .await
    {
        Ok(committed) => {
            node.network
                .broadcast_block(&committed.block, &committed.proposer)
                .await;
            Some(committed.block)
        }
        Err(err) => {
            info!(user = %user_id, action, reason = %err, "action block not produced here");
            None
        }
    };
    debug!(reputation = ?node.reputation.snapshot(), action, "after action block");
    block
}

fn zk_failure(err: ZkError) -> Reply {
    let status = match err {
        ZkError::UnknownUser(_) | ZkError::NoPendingCommitment(_) => StatusCode::NOT_FOUND,
        ZkError::ChallengeMismatch { .. } | ZkError::ProofRejected(_) => StatusCode::UNAUTHORIZED,
        ZkError::AlreadyRegistered(_) => StatusCode::BAD_REQUEST,
        ZkError::UnsupportedParams { .. } | ZkError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    reply(status, json!({"message": err.to_string()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus::NoopConsensusNetwork;
    use runtime::{ConsensusKind, ConsensusParams};

    async fn spawn(config: NodeConfig) -> anyhow::Result<String> {
        let node = create_node(&config, &PeerBook::default(), Arc::new(NoopConsensusNetwork))?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app(node).into_make_service()).await;
        });
        Ok(format!("http://{addr}"))
    }

    fn single_node(consensus: ConsensusKind) -> NodeConfig {
        NodeConfig {
            consensus,
            params: ConsensusParams {
                difficulty: 1,
                initial_reputation: Some(50.0),
                authorities: vec!["node_5000".into()],
                ..ConsensusParams::default()
            },
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn register_login_and_submit_end_to_end() -> anyhow::Result<()> {
        let base = spawn(single_node(ConsensusKind::Hierarchical)).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/register"))
            .json(&json!({"userId": "alice", "hashedPassword": 31}))
            .send()
            .await?;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await?;
        assert_eq!(body["block"]["transaction"]["action"], "register");

        let dup = client
            .post(format!("{base}/register"))
            .json(&json!({"userId": "alice", "hashedPassword": 31}))
            .send()
            .await?;
        assert_eq!(dup.status(), 400);

        let params = ZkParams::default();
        let secret = params.secret_from(31);
        let r = 6;
        let body: Value = client
            .post(format!("{base}/initiate_zkp"))
            .json(&json!({"userId": "alice", "T": params.commit(r)}))
            .send()
            .await?
            .json()
            .await?;
        let challenge = body["challenge"].as_u64().context("challenge missing")?;
        let res = client
            .post(format!("{base}/verify_zkp"))
            .json(&json!({
                "userId": "alice",
                "s": params.respond(r, challenge, secret),
                "challenge": challenge,
            }))
            .send()
            .await?;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await?;
        let token = body["token"].as_str().context("token missing")?.to_string();

        let res = client
            .post(format!("{base}/authenticate"))
            .json(&json!({"userId": "alice", "tokens": [token]}))
            .send()
            .await?;
        assert_eq!(res.status(), 200);

        let res = client
            .post(format!("{base}/process_request"))
            .json(&json!({"userId": "alice", "tokens": []}))
            .send()
            .await?;
        assert_eq!(res.status(), 401);
        let res = client
            .post(format!("{base}/process_request"))
            .json(&json!({"userId": "alice", "tokens": [token]}))
            .send()
            .await?;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await?;
        assert_eq!(body["block"]["transaction"]["action"], "process");
        assert_eq!(body["block"]["user_id"], "alice");

        let res = client
            .post(format!("{base}/add_block"))
            .json(&json!({"user_id": "alice", "transaction": {"amount": 5}, "commitment": null}))
            .send()
            .await?;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await?;
        assert_eq!(body["consensus_node"], "node_5000");

        let chain: Vec<runtime::Block> = client
            .get(format!("{base}/sync_blockchain"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(chain.len(), 4);
        assert!(chain.iter().all(runtime::Block::has_valid_hash));

        let metrics: Value = client.get(format!("{base}/metrics")).send().await?.json().await?;
        assert_eq!(metrics["difficulty"], json!([1, 1, 1]));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_user_and_bad_proof_are_refused() -> anyhow::Result<()> {
        let base = spawn(single_node(ConsensusKind::ProofOfWork)).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/initiate_zkp"))
            .json(&json!({"userId": "ghost", "T": 4}))
            .send()
            .await?;
        assert_eq!(res.status(), 404);

        client
            .post(format!("{base}/register"))
            .json(&json!({"userId": "bob", "hashedPassword": 3}))
            .send()
            .await?;
        let body: Value = client
            .post(format!("{base}/initiate_zkp"))
            .json(&json!({"userId": "bob", "T": 4}))
            .send()
            .await?
            .json()
            .await?;
        let challenge = body["challenge"].as_u64().context("challenge missing")?;
        let mut statuses = Vec::new();
        for s in 0..2u64 {
            let res = client
                .post(format!("{base}/verify_zkp"))
                .json(&json!({"userId": "bob", "s": s, "challenge": challenge}))
                .send()
                .await?;
            statuses.push(res.status().as_u16());
        }
        // The commitment is spent by the first attempt.
        assert_eq!(statuses[1], 404);
        let res = client
            .post(format!("{base}/authenticate"))
            .json(&json!({"userId": "bob", "tokens": []}))
            .send()
            .await?;
        assert_eq!(res.status(), 401, "an empty bundle never passes");
        Ok(())
    }

    #[tokio::test]
    async fn peers_can_vote_cancel_and_deliver_blocks() -> anyhow::Result<()> {
        let base = spawn(single_node(ConsensusKind::ProofOfWork)).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/select_node"))
            .json(&json!({"stop_time": 1.0}))
            .send()
            .await?;
        assert_eq!(res.status(), 400);
        let res = client
            .post(format!("{base}/select_node"))
            .json(&json!({"consensus_id": "node_5001", "stop_time": 1.0}))
            .send()
            .await?;
        assert_eq!(res.status(), 200);

        let genesis = runtime::genesis_block();
        let mut fields = runtime::BlockFields {
            user_id: "carol".into(),
            previous_hash: genesis.hash.clone(),
            transaction: json!("remote"),
            commitment: Value::Null,
            timestamp: runtime::now_secs(),
            nonce: 0,
            validator: None,
        };
        while !runtime::meets_difficulty(&fields.clone().seal().hash, 1) {
            fields.nonce += 1;
        }

        let vote: VoteResponse = client
            .post(format!("{base}/vote_on_block"))
            .json(&json!({"block": fields}))
            .send()
            .await?
            .json()
            .await?;
        assert!(vote.vote);

        let announcement = BlockAnnouncement {
            fields: fields.clone(),
            consensus_node: "node_5001".into(),
        };
        let res = client
            .post(format!("{base}/receive_block"))
            .json(&announcement)
            .send()
            .await?;
        assert_eq!(res.status(), 200);
        let res = client
            .post(format!("{base}/receive_block"))
            .json(&announcement)
            .send()
            .await?;
        assert_eq!(res.status(), 400, "replay must not link");

        let queued: Value = client
            .post(format!("{base}/queue_transaction"))
            .json(&json!({"transaction": {"memo": "later"}}))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(queued["pending"], 1);
        Ok(())
    }
}
