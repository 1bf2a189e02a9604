//! Bounded per-session replay buffer.
//!
//! Entries are evicted oldest-first once they exceed the soft capacity AND
//! every retained client cursor has acknowledged them. Past the hard limit
//! the oldest entry goes regardless; `since` then reports a gap for any
//! cursor that fell behind, and the caller sends a snapshot instead.

use std::collections::VecDeque;
use std::sync::Arc;

use opta_protocol::Envelope;

#[derive(Debug, PartialEq)]
pub enum Replay {
    /// Every envelope with `seq > after_seq`, in order (possibly empty).
    Events(Vec<Arc<Envelope>>),
    /// The range is no longer (or never was) covered; resynchronize.
    Gap,
}

#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<Arc<Envelope>>,
    soft_capacity: usize,
    hard_capacity: usize,
    /// Highest seq ever evicted; 0 when nothing has been dropped.
    evicted_through: u64,
}

impl ReplayBuffer {
    pub fn new(soft_capacity: usize, hard_capacity: usize) -> Self {
        let soft_capacity = soft_capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(soft_capacity.min(1024)),
            soft_capacity,
            hard_capacity: hard_capacity.max(soft_capacity),
            evicted_through: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn evicted_through(&self) -> u64 {
        self.evicted_through
    }

    /// Append a sequenced envelope. `min_ack` is the lowest acknowledged seq
    /// among retained clients (`None` when there are none).
    pub fn push(&mut self, envelope: Arc<Envelope>, min_ack: Option<u64>) {
        self.entries.push_back(envelope);
        self.evict(min_ack);
    }

    /// Re-run eviction after cursors advance or clients expire.
    pub fn evict(&mut self, min_ack: Option<u64>) {
        while self.entries.len() > self.soft_capacity {
            let Some(front) = self.entries.front() else {
                break;
            };
            let acknowledged = min_ack.map_or(true, |ack| front.seq <= ack);
            if !acknowledged && self.entries.len() <= self.hard_capacity {
                break;
            }
            self.evicted_through = front.seq;
            self.entries.pop_front();
        }
    }

    /// Envelopes after `after_seq`, given the session's current `last_seq`.
    pub fn since(&self, after_seq: u64, last_seq: u64) -> Replay {
        if after_seq > last_seq {
            // Cursor from another daemon run or a different session.
            return Replay::Gap;
        }
        if after_seq == last_seq {
            return Replay::Events(Vec::new());
        }
        if after_seq < self.evicted_through {
            return Replay::Gap;
        }
        let start = self.entries.partition_point(|env| env.seq <= after_seq);
        Replay::Events(self.entries.iter().skip(start).cloned().collect())
    }

    /// Like `since`, but capped at `limit` entries (HTTP polling).
    pub fn page(&self, after_seq: u64, last_seq: u64, limit: usize) -> Replay {
        match self.since(after_seq, last_seq) {
            Replay::Events(mut events) => {
                events.truncate(limit);
                Replay::Events(events)
            }
            Replay::Gap => Replay::Gap,
        }
    }
}
