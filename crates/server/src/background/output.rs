//! Bounded per-process output buffer with reader watermarks.

use std::collections::{HashMap, VecDeque};

use opta_protocol::{OutputChunk, OutputSlice, OutputStream, StreamFilter};

#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    last_seq: u64,
    /// Highest seq dropped; 0 when nothing has been.
    dropped_through: u64,
    retention: usize,
    hard_limit: usize,
    /// reader id → highest seq that reader has consumed
    readers: HashMap<String, u64>,
}

impl OutputBuffer {
    /// `start_seq` is the last seq already used, so a restarted process
    /// continues its predecessor's numbering.
    pub fn new(retention: usize, hard_limit: usize, start_seq: u64) -> Self {
        let retention = retention.max(1);
        Self {
            chunks: VecDeque::new(),
            last_seq: start_seq,
            dropped_through: start_seq,
            retention,
            hard_limit: hard_limit.max(retention),
            readers: HashMap::new(),
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn push(&mut self, stream: OutputStream, text: String, now: u64) -> OutputChunk {
        self.last_seq += 1;
        let chunk = OutputChunk {
            seq: self.last_seq,
            timestamp: now,
            stream,
            text,
        };
        self.chunks.push_back(chunk.clone());
        self.evict();
        chunk
    }

    fn evict(&mut self) {
        let watermark = self.readers.values().min().copied();
        while self.chunks.len() > self.retention {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let consumed = watermark.map_or(true, |w| front.seq <= w);
            if !consumed && self.chunks.len() <= self.hard_limit {
                break;
            }
            self.dropped_through = front.seq;
            self.chunks.pop_front();
        }
    }

    /// Chunks with `seq > after_seq` matching `filter`, oldest first.
    pub fn read(
        &mut self,
        process_id: &str,
        after_seq: u64,
        limit: usize,
        filter: StreamFilter,
        reader: Option<&str>,
    ) -> OutputSlice {
        let limit = limit.max(1);
        let truncated = after_seq < self.dropped_through;

        let mut chunks = Vec::new();
        let mut has_more = false;
        for chunk in self
            .chunks
            .iter()
            .filter(|c| c.seq > after_seq && filter.accepts(c.stream))
        {
            if chunks.len() == limit {
                has_more = true;
                break;
            }
            chunks.push(chunk.clone());
        }

        let next_seq = if has_more {
            chunks.last().map(|c| c.seq).unwrap_or(after_seq)
        } else {
            // Everything retained that matches was returned.
            self.last_seq
        };

        if let Some(reader) = reader {
            let mark = self.readers.entry(reader.to_string()).or_insert(0);
            *mark = (*mark).max(next_seq);
            self.evict();
        }

        OutputSlice {
            process_id: process_id.to_string(),
            chunks,
            next_seq,
            has_more,
            truncated,
            oldest_seq: self.chunks.front().map(|c| c.seq),
        }
    }
}
