use runtime::Timestamp;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Shared between a nonce search and the handler that receives a peer's
/// "I found one" announcement.
///
/// The found timestamp and the abort decision are taken under the same lock,
/// so a search never records a find after it has been told to yield, and an
/// abort never lands after a strictly earlier local find. Every reset starts
/// a new round; finds reported for an older round are dropped.
#[derive(Debug, Default)]
pub struct CancelSignal {
    aborted: AtomicBool,
    round: AtomicU64,
    found_at: Mutex<Option<Timestamp>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear both flags and start a new round, returning its number.
    pub fn reset(&self) -> u64 {
        let mut found = self.found_at.lock().unwrap();
        *found = None;
        self.aborted.store(false, Ordering::Release);
        self.round.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn round(&self) -> u64 {
        self.round.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn found_at(&self) -> Option<Timestamp> {
        *self.found_at.lock().unwrap()
    }

    /// Yield to a peer that found a block at `remote`. Ignored when this
    /// node already found one at or before that time.
    pub fn try_abort(&self, remote: Timestamp) -> bool {
        let found = self.found_at.lock().unwrap();
        let yields = match *found {
            None => true,
            Some(local) => local > remote,
        };
        if yields {
            self.aborted.store(true, Ordering::Release);
        }
        yields
    }

    /// Returns false when an abort already landed; the find is then dropped.
    pub fn record_found(&self, at: Timestamp) -> bool {
        self.record_found_in(self.round(), at)
    }

    /// Like [`record_found`](Self::record_found), but also refuses a find
    /// from a round that has since been reset.
    pub fn record_found_in(&self, round: u64, at: Timestamp) -> bool {
        let mut found = self.found_at.lock().unwrap();
        if self.aborted.load(Ordering::Acquire) || self.round() != round {
            return false;
        }
        *found = Some(at);
        true
    }
}
