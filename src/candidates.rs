// src/candidates.rs
//
// Per-remote-id queues of ICE candidates that arrived before the remote
// description they belong to.

use std::collections::{HashMap, VecDeque};
use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// FIFO candidate queues keyed by remote id.
///
/// Queues are created lazily on the first premature candidate and removed
/// entirely by [`CandidateBuffer::take`] or [`CandidateBuffer::discard`].
/// Each queue is bounded; candidates beyond the limit are dropped.
#[derive(Debug)]
pub struct CandidateBuffer {
    queues: HashMap<String, VecDeque<RTCIceCandidateInit>>,
    limit: usize,
}

impl CandidateBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            queues: HashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Queue a candidate.  Returns `false` if the queue for `remote_id` is
    /// full and the candidate was dropped.
    pub fn push(&mut self, remote_id: &str, candidate: RTCIceCandidateInit) -> bool {
        let queue = self.queues.entry(remote_id.to_string()).or_default();
        if queue.len() >= self.limit {
            warn!(remote_id, limit = self.limit, "candidate queue full; dropping candidate");
            return false;
        }
        queue.push_back(candidate);
        true
    }

    /// Remove and return the whole queue for `remote_id`, oldest first.
    pub fn take(&mut self, remote_id: &str) -> Vec<RTCIceCandidateInit> {
        self.queues
            .remove(remote_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drop the queue for `remote_id`; returns how many candidates it held.
    pub fn discard(&mut self, remote_id: &str) -> usize {
        self.queues.remove(remote_id).map_or(0, |q| q.len())
    }

    pub fn pending(&self, remote_id: &str) -> usize {
        self.queues.get(remote_id).map_or(0, VecDeque::len)
    }

    pub fn has_queue(&self, remote_id: &str) -> bool {
        self.queues.contains_key(remote_id)
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn take_returns_fifo_and_removes_queue() {
        let mut buf = CandidateBuffer::new(8);
        buf.push("s1", cand(1));
        buf.push("s1", cand(2));
        buf.push("s2", cand(9));
        buf.push("s1", cand(3));

        let drained = buf.take("s1");
        let order: Vec<_> = drained.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(order, vec![cand(1).candidate, cand(2).candidate, cand(3).candidate]);
        assert!(!buf.has_queue("s1"));
        assert!(buf.take("s1").is_empty());
        assert_eq!(buf.pending("s2"), 1);
    }

    #[test]
    fn queue_is_bounded() {
        let mut buf = CandidateBuffer::new(2);
        assert!(buf.push("s1", cand(1)));
        assert!(buf.push("s1", cand(2)));
        assert!(!buf.push("s1", cand(3)));
        assert_eq!(buf.pending("s1"), 2);
        assert!(buf.push("s2", cand(4)));
        assert_eq!(buf.total(), 3);
    }

    #[test]
    fn discard_and_clear() {
        let mut buf = CandidateBuffer::new(4);
        buf.push("s1", cand(1));
        buf.push("s2", cand(2));
        assert_eq!(buf.discard("s1"), 1);
        assert_eq!(buf.discard("s1"), 0);
        buf.clear();
        assert_eq!(buf.total(), 0);
    }
}
