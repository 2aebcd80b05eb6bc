//! Password login without sending the password.
//!
//! A Schnorr-style challenge/response over a small prime field: the user
//! registers `secret = hashed_password mod (p - 1)`, commits to a random `r`
//! with `T = g^r`, receives a challenge `c` and answers `s = r + c * secret`.
//! The node accepts when `g^s == T * C^c (mod p)` with `C = g^secret`, then
//! mints a session token.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

mod session;

pub use session::{SessionClaims, SessionIssuer};

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("unsupported group parameters p={p}, g={g}")]
    UnsupportedParams { p: u64, g: u64 },
    #[error("user {0} already registered")]
    AlreadyRegistered(String),
    #[error("user {0} not registered")]
    UnknownUser(String),
    #[error("no pending commitment for {0}")]
    NoPendingCommitment(String),
    #[error("challenge {got} was not issued (expected {expected})")]
    ChallengeMismatch { expected: u64, got: u64 },
    #[error("proof rejected for {0}")]
    ProofRejected(String),
    #[error("session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// `base^exp mod modulus` with 128-bit intermediates.
pub fn mod_pow(base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let m = modulus as u128;
    let mut base = base as u128 % m;
    let mut acc: u128 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc * base % m;
        }
        base = base * base % m;
        exp >>= 1;
    }
    acc as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkParams {
    p: u64,
    g: u64,
}

impl Default for ZkParams {
    fn default() -> Self {
        Self { p: 29, g: 5 }
    }
}

impl ZkParams {
    pub fn new(p: u64, g: u64) -> Result<Self, ZkError> {
        if p < 5 || p > u32::MAX as u64 || g < 2 || g >= p {
            return Err(ZkError::UnsupportedParams { p, g });
        }
        Ok(Self { p, g })
    }

    pub fn p(&self) -> u64 {
        self.p
    }

    pub fn g(&self) -> u64 {
        self.g
    }

    pub fn secret_from(&self, hashed_password: u64) -> u64 {
        hashed_password % (self.p - 1)
    }

    /// `C = g^secret mod p`.
    pub fn public_key(&self, secret: u64) -> u64 {
        mod_pow(self.g, secret, self.p)
    }

    /// Prover's first message `T = g^r mod p`.
    pub fn commit(&self, r: u64) -> u64 {
        mod_pow(self.g, r, self.p)
    }

    /// Prover's answer `s = (r + c * secret) mod (p - 1)`.
    pub fn respond(&self, r: u64, challenge: u64, secret: u64) -> u64 {
        let order = (self.p - 1) as u128;
        ((r as u128 + challenge as u128 * secret as u128) % order) as u64
    }

    pub fn verify(&self, commitment: u64, public_key: u64, challenge: u64, response: u64) -> bool {
        let lhs = mod_pow(self.g, response, self.p);
        let rhs = (commitment as u128 * mod_pow(public_key, challenge, self.p) as u128
            % self.p as u128) as u64;
        lhs == rhs
    }

    /// Uniform in `[1, p - 2]`.
    pub fn challenge(&self, rng: &mut impl Rng) -> u64 {
        rng.gen_range(1..=self.p - 2)
    }

    /// Random nonce for the prover, uniform in `[1, p - 2]`.
    pub fn nonce(&self, rng: &mut impl Rng) -> u64 {
        self.challenge(rng)
    }
}

#[derive(Debug, Clone)]
struct UserRecord {
    secret: u64,
    tokens: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct PendingProof {
    commitment: u64,
    challenge: u64,
}

#[derive(Default)]
struct AuthState {
    users: HashMap<String, UserRecord>,
    pending: HashMap<String, PendingProof>,
}

/// Per-node login state: registered users, outstanding challenges and the
/// tokens handed out so far.
pub struct Authenticator {
    node_id: String,
    params: ZkParams,
    issuer: SessionIssuer,
    state: Mutex<AuthState>,
}

impl Authenticator {
    pub fn new(node_id: impl Into<String>, params: ZkParams, issuer: SessionIssuer) -> Self {
        Self {
            node_id: node_id.into(),
            params,
            issuer,
            state: Mutex::new(AuthState::default()),
        }
    }

    pub fn params(&self) -> ZkParams {
        self.params
    }

    pub fn issuer(&self) -> &SessionIssuer {
        &self.issuer
    }

    pub fn register(&self, user_id: &str, hashed_password: u64) -> Result<(), ZkError> {
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(user_id) {
            warn!(user_id, "duplicate registration");
            return Err(ZkError::AlreadyRegistered(user_id.to_string()));
        }
        state.users.insert(
            user_id.to_string(),
            UserRecord {
                secret: self.params.secret_from(hashed_password),
                tokens: Vec::new(),
            },
        );
        info!(user_id, "user registered");
        Ok(())
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.state.lock().unwrap().users.contains_key(user_id)
    }

    /// Store the commitment and hand back a fresh challenge. A second call
    /// replaces the outstanding one.
    pub fn initiate(&self, user_id: &str, commitment: u64) -> Result<u64, ZkError> {
        let mut state = self.state.lock().unwrap();
        if !state.users.contains_key(user_id) {
            return Err(ZkError::UnknownUser(user_id.to_string()));
        }
        let challenge = self.params.challenge(&mut rand::thread_rng());
        state.pending.insert(
            user_id.to_string(),
            PendingProof {
                commitment,
                challenge,
            },
        );
        Ok(challenge)
    }

    /// Check the response against the outstanding commitment. The
    /// commitment is spent whether or not the proof holds.
    pub fn verify(&self, user_id: &str, response: u64, challenge: u64) -> Result<String, ZkError> {
        let mut state = self.state.lock().unwrap();
        let secret = state
            .users
            .get(user_id)
            .map(|u| u.secret)
            .ok_or_else(|| ZkError::UnknownUser(user_id.to_string()))?;
        let pending = state
            .pending
            .remove(user_id)
            .ok_or_else(|| ZkError::NoPendingCommitment(user_id.to_string()))?;
        if pending.challenge != challenge {
            warn!(user_id, expected = pending.challenge, got = challenge, "challenge mismatch");
            return Err(ZkError::ChallengeMismatch {
                expected: pending.challenge,
                got: challenge,
            });
        }
        let public_key = self.params.public_key(secret);
        if !self
            .params
            .verify(pending.commitment, public_key, challenge, response)
        {
            warn!(user_id, "proof rejected");
            return Err(ZkError::ProofRejected(user_id.to_string()));
        }
        let token = self.issuer.issue(user_id, &self.node_id)?;
        if let Some(user) = state.users.get_mut(user_id) {
            user.tokens.push(token.clone());
        }
        info!(user_id, "proof accepted, session issued");
        Ok(token)
    }

    pub fn tokens_for(&self, user_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(user_id)
            .map(|u| u.tokens.clone())
            .unwrap_or_default()
    }

    /// Tokens that decode under the shared secret, are unexpired and name
    /// `user_id`. Duplicates count once.
    pub fn count_valid(&self, user_id: &str, tokens: &[String]) -> usize {
        let mut seen: HashSet<&str> = HashSet::with_capacity(tokens.len());
        let mut valid = 0;
        for token in tokens {
            if !seen.insert(token.as_str()) {
                continue;
            }
            match self.issuer.decode(token) {
                Ok(claims) if claims.user_id == user_id => valid += 1,
                Ok(_) => {}
                Err(err) => warn!(user_id, error = %err, "token rejected"),
            }
        }
        valid
    }

    /// A bundle passes when more than half of `peer_count` tokens are valid.
    pub fn authenticate(&self, user_id: &str, tokens: &[String], peer_count: usize) -> bool {
        let valid = self.count_valid(user_id, tokens);
        let ok = valid > peer_count / 2;
        info!(user_id, valid, peer_count, ok, "bundle checked");
        ok
    }
}
