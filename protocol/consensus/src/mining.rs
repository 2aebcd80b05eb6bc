use crate::{CancelSignal, ConsensusError};
use runtime::{hash_fields, meets_difficulty, now_secs, Block, BlockFields};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One nonce search. `template` carries everything but the nonce and the
/// timestamp, which are rewritten on every attempt.
#[derive(Debug, Clone)]
pub struct SearchJob {
    pub template: BlockFields,
    pub difficulty: u32,
    pub start_nonce: u64,
    pub max_attempts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Found(Block),
    Cancelled,
    Exhausted(u64),
}

/// Blocking search loop. Checks the cancel signal before every attempt.
pub fn search(job: SearchJob, signal: &CancelSignal) -> SearchOutcome {
    search_in_round(job, signal, signal.round(), &AtomicBool::new(false))
}

/// Stops once `abandoned` is set or `signal` moves past `round`.
fn search_in_round(
    job: SearchJob,
    signal: &CancelSignal,
    round: u64,
    abandoned: &AtomicBool,
) -> SearchOutcome {
    let SearchJob {
        mut template,
        difficulty,
        start_nonce,
        max_attempts,
    } = job;
    let mut nonce = start_nonce;
    let mut attempts: u64 = 0;
    loop {
        if signal.is_aborted() || signal.round() != round || abandoned.load(Ordering::Acquire) {
            debug!(attempts, "nonce search cancelled");
            return SearchOutcome::Cancelled;
        }
        if max_attempts.is_some_and(|max| attempts >= max) {
            return SearchOutcome::Exhausted(attempts);
        }
        template.nonce = nonce;
        template.timestamp = now_secs();
        let hash = hash_fields(&template);
        if meets_difficulty(&hash, difficulty) {
            if !signal.record_found_in(round, template.timestamp) {
                return SearchOutcome::Cancelled;
            }
            debug!(attempts, nonce, %hash, "nonce found");
            return SearchOutcome::Found(template.seal());
        }
        nonce = nonce.wrapping_add(1);
        attempts += 1;
    }
}

/// Sets the flag when the awaiting future goes away, so the worker does not
/// outlive its round.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs [`search`] on the blocking pool so request handlers stay responsive.
/// Dropping the returned future stops the worker.
pub(crate) async fn run_search(
    job: SearchJob,
    signal: Arc<CancelSignal>,
) -> Result<SearchOutcome, ConsensusError> {
    let round = signal.round();
    let abandoned = Arc::new(AtomicBool::new(false));
    let _guard = AbandonOnDrop(abandoned.clone());
    tokio::task::spawn_blocking(move || search_in_round(job, &signal, round, &abandoned))
        .await
        .map_err(|err| ConsensusError::Worker(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(difficulty: u32, max_attempts: Option<u64>) -> SearchJob {
        SearchJob {
            template: BlockFields {
                user_id: "alice".into(),
                previous_hash: "0".into(),
                transaction: json!({"amount": 1}),
                commitment: json!(null),
                timestamp: 0.0,
                nonce: 0,
                validator: None,
            },
            difficulty,
            start_nonce: 0,
            max_attempts,
        }
    }

    #[test]
    fn finds_a_block_meeting_difficulty() {
        let signal = CancelSignal::new();
        match search(job(1, None), &signal) {
            SearchOutcome::Found(block) => {
                assert!(block.hash.starts_with('0'));
                assert!(block.has_valid_hash());
                assert_eq!(signal.found_at(), Some(block.timestamp));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn aborted_signal_stops_immediately() {
        let signal = CancelSignal::new();
        signal.try_abort(0.0);
        assert_eq!(search(job(64, None), &signal), SearchOutcome::Cancelled);
    }

    #[test]
    fn abandoned_or_stale_search_stops() {
        let signal = CancelSignal::new();
        let round = signal.reset();
        let abandoned = AtomicBool::new(true);
        assert_eq!(
            search_in_round(job(64, None), &signal, round, &abandoned),
            SearchOutcome::Cancelled
        );

        signal.reset();
        let live = AtomicBool::new(false);
        assert_eq!(
            search_in_round(job(1, None), &signal, round, &live),
            SearchOutcome::Cancelled
        );
        assert_eq!(signal.found_at(), None);
    }

    #[tokio::test]
    async fn dropping_the_search_future_releases_the_worker() {
        let signal = Arc::new(CancelSignal::new());
        signal.reset();
        let pending = run_search(job(64, None), signal.clone());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), pending).await;
        assert!(timed_out.is_err());
        // The worker still holds a clone until it notices the abandon flag.
        for _ in 0..200 {
            if Arc::strong_count(&signal) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&signal), 1);
    }

    #[test]
    fn attempt_bound_is_honoured() {
        let signal = CancelSignal::new();
        assert_eq!(search(job(64, Some(25)), &signal), SearchOutcome::Exhausted(25));
    }
}
