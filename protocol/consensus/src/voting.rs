use crate::ConsensusNetwork;
use futures::future::join_all;
use runtime::BlockFields;
use serde::Serialize;
use state::NodeId;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub yes: usize,
    pub no: usize,
}

impl VoteTally {
    pub fn from_votes(votes: impl IntoIterator<Item = bool>) -> Self {
        votes.into_iter().fold(Self::default(), |mut tally, vote| {
            if vote {
                tally.yes += 1;
            } else {
                tally.no += 1;
            }
            tally
        })
    }

    pub fn total(&self) -> usize {
        self.yes + self.no
    }
}

/// Remote YES votes a proposing leader needs when `leaders` leaders exist,
/// the proposer included. Together with the proposer's own vote this is the
/// usual `2n/3 + 1` quorum.
pub fn inter_cluster_threshold(leaders: usize) -> usize {
    (leaders * 2) / 3
}

/// Fan the request out to every voter at once. A voter that errors or
/// misses `timeout` counts as NO.
pub async fn collect_votes(
    network: &dyn ConsensusNetwork,
    voters: &[NodeId],
    candidate: &BlockFields,
    timeout: Duration,
) -> VoteTally {
    let requests = voters.iter().map(|peer| async move {
        match tokio::time::timeout(timeout, network.request_vote(peer, candidate)).await {
            Ok(Ok(vote)) => {
                debug!(peer = %peer, vote, "vote received");
                vote
            }
            Ok(Err(err)) => {
                warn!(peer = %peer, error = %err, "vote request failed, counting NO");
                false
            }
            Err(_) => {
                warn!(peer = %peer, ?timeout, "vote request timed out, counting NO");
                false
            }
        }
    });
    VoteTally::from_votes(join_all(requests).await)
}
