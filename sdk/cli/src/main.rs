use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use zk_core::ZkParams;

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "Client for swarm ledger nodes: register, log in, submit blocks", long_about = None)]
struct Cli {
    /// Comma-separated node base URLs
    #[arg(
        long,
        env = "LEDGER_NODES",
        default_value = "http://127.0.0.1:5000,http://127.0.0.1:5001,http://127.0.0.1:5002"
    )]
    nodes: String,

    /// Group modulus shared with the nodes
    #[arg(long, env = "ZK_P", default_value = "29")]
    p: u64,

    /// Group generator shared with the nodes
    #[arg(long, env = "ZK_G", default_value = "5")]
    g: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "100")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a user on every node
    Register {
        #[arg(long)]
        user: String,
        /// Numeric password hash
        #[arg(long)]
        password: u64,
    },
    /// Prove knowledge of the password to every node and collect tokens
    Login {
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: u64,
        /// Present the collected tokens to the first node afterwards
        #[arg(long)]
        check: bool,
    },
    /// Ask the first node to add a block
    Submit {
        #[arg(long)]
        user: String,
        /// Transaction as JSON
        #[arg(long)]
        transaction: String,
        /// Commitment as JSON
        #[arg(long, default_value = "null")]
        commitment: String,
    },
    /// Queue a transaction for the first node's next block
    Queue {
        #[arg(long)]
        transaction: String,
    },
    /// Print the first node's chain
    Chain,
    /// Print the first node's chain metrics
    Metrics,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    challenge: u64,
}

#[derive(Deserialize)]
struct VerifyResponse {
    token: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::builder()
        .timeout(Duration::from_secs(cli.timeout))
        .build()
        .context("building http client")?;
    let nodes = parse_nodes(&cli.nodes);
    let first = nodes
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no nodes configured"))?;

    match cli.command {
        Commands::Register { user, password } => {
            let body = json!({ "userId": user, "hashedPassword": password });
            let mut accepted = 0;
            for node in &nodes {
                match post(&client, node, "register", &body) {
                    Ok(_) => {
                        accepted += 1;
                        println!("{node}: registered");
                    }
                    Err(err) => println!("{node}: {err:#}"),
                }
            }
            println!("registered on {accepted}/{} nodes", nodes.len());
        }
        Commands::Login {
            user,
            password,
            check,
        } => {
            let params = ZkParams::new(cli.p, cli.g).context("invalid group parameters")?;
            let secret = params.secret_from(password);
            let mut tokens = Vec::new();
            for node in &nodes {
                match login(&client, node, &params, &user, secret) {
                    Ok(token) => {
                        println!("{node}: login successful");
                        tokens.push(token);
                    }
                    Err(err) => println!("{node}: {err:#}"),
                }
            }
            println!("tokens from {}/{} nodes", tokens.len(), nodes.len());
            if check {
                let body = json!({ "userId": user, "tokens": tokens });
                let res = post(&client, &first, "authenticate", &body)?;
                println!("{}", serde_json::to_string_pretty(&res)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&tokens)?);
            }
        }
        Commands::Submit {
            user,
            transaction,
            commitment,
        } => {
            let transaction: Value =
                serde_json::from_str(&transaction).context("parsing transaction json")?;
            let commitment: Value =
                serde_json::from_str(&commitment).context("parsing commitment json")?;
            let body = json!({
                "user_id": user,
                "transaction": transaction,
                "commitment": commitment,
            });
            let res = post(&client, &first, "add_block", &body)?;
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
        Commands::Queue { transaction } => {
            let transaction: Value =
                serde_json::from_str(&transaction).context("parsing transaction json")?;
            let body = json!({ "transaction": transaction });
            let res = post(&client, &first, "queue_transaction", &body)?;
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
        Commands::Chain => {
            let res = get(&client, &first, "sync_blockchain")?;
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
        Commands::Metrics => {
            let res = get(&client, &first, "metrics")?;
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
    }
    Ok(())
}

/// One challenge/response exchange. Each node issues its own challenge, so
/// the proof is redone per node with a fresh nonce.
fn login(
    client: &Client,
    node: &str,
    params: &ZkParams,
    user: &str,
    secret: u64,
) -> anyhow::Result<String> {
    let r = params.nonce(&mut rand::thread_rng());
    let commitment = params.commit(r);
    let res = post(client, node, "initiate_zkp", &json!({ "userId": user, "T": commitment }))?;
    let ChallengeResponse { challenge } =
        serde_json::from_value(res).context("decoding challenge")?;
    let s = params.respond(r, challenge, secret);
    let res = post(
        client,
        node,
        "verify_zkp",
        &json!({ "userId": user, "s": s, "challenge": challenge }),
    )?;
    let VerifyResponse { token } = serde_json::from_value(res).context("decoding token")?;
    Ok(token)
}

fn parse_nodes(list: &str) -> Vec<String> {
    list.split(',')
        .map(|n| n.trim().trim_end_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

fn post(client: &Client, node: &str, route: &str, body: &Value) -> anyhow::Result<Value> {
    let url = format!("{node}/{route}");
    let res = client
        .post(&url)
        .json(body)
        .send()
        .with_context(|| format!("sending request to {url}"))?;
    decode(res)
}

fn get(client: &Client, node: &str, route: &str) -> anyhow::Result<Value> {
    let url = format!("{node}/{route}");
    let res = client
        .get(&url)
        .send()
        .with_context(|| format!("sending request to {url}"))?;
    decode(res)
}

fn decode(res: reqwest::blocking::Response) -> anyhow::Result<Value> {
    let status = res.status();
    let body: Value = res.json().unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        return Err(anyhow!("{status}: {message}"));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn node_list_is_trimmed() {
        assert_eq!(
            parse_nodes(" http://a:5000/ ,,http://b:5001"),
            vec!["http://a:5000", "http://b:5001"]
        );
    }

    #[test]
    fn login_flags_parse() {
        let cli = Cli::try_parse_from([
            "ledger-cli",
            "--nodes",
            "http://x:1",
            "login",
            "--user",
            "alice",
            "--password",
            "31",
            "--check",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Login { ref user, password: 31, check: true } if user == "alice"
        ));
    }
}
