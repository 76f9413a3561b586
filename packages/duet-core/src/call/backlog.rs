//! Buffer for connectivity candidates that arrive before a peer session exists.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Most candidates kept by [`IceBacklog::prune`]. The oldest entry goes first.
pub const MAX_BUFFERED_CANDIDATES: usize = 64;

/// Candidates older than this are dropped by [`IceBacklog::prune`].
pub const MAX_CANDIDATE_AGE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Buffered {
    from_user_id: String,
    candidate: Value,
    received: Instant,
}

/// FIFO of candidates keyed by sender.
///
/// `push` never drops anything. `take_buffered` hands back the candidates of
/// one sender in arrival order and discards the rest, which belong to callers
/// the session is not talking to. Candidates nobody has claimed yet are
/// bounded with `prune`.
#[derive(Debug, Default)]
pub struct IceBacklog {
    queue: VecDeque<Buffered>,
}

impl IceBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, from_user_id: impl Into<String>, candidate: Value, now: Instant) {
        self.queue.push_back(Buffered {
            from_user_id: from_user_id.into(),
            candidate,
            received: now,
        });
    }

    /// Take every buffered candidate from `user_id`, oldest first.
    pub fn take_buffered(&mut self, user_id: &str) -> Vec<Value> {
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for entry in self.queue.drain(..) {
            if entry.from_user_id == user_id {
                kept.push(entry.candidate);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(user_id, dropped, "Discarded candidates from other callers");
        }
        kept
    }

    /// Keep only the candidates from `user_id`.
    pub fn retain_from(&mut self, user_id: &str) {
        self.queue.retain(|entry| entry.from_user_id == user_id);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop entries older than [`MAX_CANDIDATE_AGE`], then the oldest ones
    /// beyond [`MAX_BUFFERED_CANDIDATES`].
    pub fn prune(&mut self, now: Instant) {
        let before = self.queue.len();
        self.queue
            .retain(|entry| now.saturating_duration_since(entry.received) < MAX_CANDIDATE_AGE);
        let excess = self.queue.len().saturating_sub(MAX_BUFFERED_CANDIDATES);
        self.queue.drain(..excess);
        let dropped = before - self.queue.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Pruned unclaimed candidates");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_take_preserves_arrival_order() {
        let now = Instant::now();
        let mut backlog = IceBacklog::new();
        backlog.push("alice", json!({"candidate": "c1"}), now);
        backlog.push("alice", json!({"candidate": "c2"}), now);
        backlog.push("alice", json!({"candidate": "c3"}), now);

        assert_eq!(
            backlog.take_buffered("alice"),
            vec![json!({"candidate": "c1"}), json!({"candidate": "c2"}), json!({"candidate": "c3"})]
        );
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_take_discards_other_senders() {
        let now = Instant::now();
        let mut backlog = IceBacklog::new();
        backlog.push("carol", json!({"candidate": "x"}), now);
        backlog.push("alice", json!({"candidate": "c1"}), now);
        backlog.push("carol", json!({"candidate": "y"}), now);
        backlog.push("alice", json!({"candidate": "c2"}), now);
        assert_eq!(backlog.len(), 4);

        let taken = backlog.take_buffered("alice");

        assert_eq!(taken, vec![json!({"candidate": "c1"}), json!({"candidate": "c2"})]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_prune_caps_oldest_first() {
        let now = Instant::now();
        let mut backlog = IceBacklog::new();
        backlog.push("alice", json!({"candidate": "first"}), now);
        for n in 0..MAX_BUFFERED_CANDIDATES {
            backlog.push(format!("spam{}", n), json!({"candidate": n}), now);
        }
        assert_eq!(backlog.len(), MAX_BUFFERED_CANDIDATES + 1);

        backlog.prune(now);

        assert_eq!(backlog.len(), MAX_BUFFERED_CANDIDATES);
        assert!(backlog.take_buffered("alice").is_empty());
    }

    #[test]
    fn test_prune_expires_old_candidates() {
        let start = Instant::now();
        let mut backlog = IceBacklog::new();
        backlog.push("alice", json!({"candidate": "old"}), start);
        let later = start + MAX_CANDIDATE_AGE / 2;
        backlog.push("alice", json!({"candidate": "fresh"}), later);

        backlog.prune(start + MAX_CANDIDATE_AGE);
        let taken = backlog.take_buffered("alice");

        assert_eq!(taken, vec![json!({"candidate": "fresh"})]);
    }

    #[test]
    fn test_retain_from_keeps_one_sender() {
        let now = Instant::now();
        let mut backlog = IceBacklog::new();
        backlog.push("carol", json!({"candidate": "x"}), now);
        backlog.push("alice", json!({"candidate": "c1"}), now);

        backlog.retain_from("alice");

        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.take_buffered("alice"), vec![json!({"candidate": "c1"})]);
    }
}
