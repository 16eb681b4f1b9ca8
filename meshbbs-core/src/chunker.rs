//! Outbound splitting and inbound reassembly of oversized payloads for the
//! mesh radio's narrow MTU.
//!
//! Outbound chunks are prefixed `[<seq>/<total>] ` (1-indexed). Inbound
//! reassembly is keyed by `(sender_node, total)` and carries two
//! timestamps: `created` (the total-timeout anchor) and `last_chunk` (the
//! sliding per-chunk anchor) so a stalled sender's buffer is dropped
//! without ever retransmitting on the chunker's own initiative — that is
//! left to the sending protocol (the mail FSM retries the whole message).

use std::collections::HashMap;
use std::time::Duration;

/// Split `payload` into chunks no larger than `content_size`, bounded by
/// `max_chunks`. Returns `None` if it would not fit even at `max_chunks`
/// pieces, `Some(vec![payload])`-equivalent (a single untouched string) if
/// it already fits.
pub fn chunk(payload: &str, content_size: usize, max_chunks: u32) -> Option<Vec<String>> {
    if payload.len() <= content_size {
        return Some(vec![payload.to_string()]);
    }

    let pieces: Vec<&str> = split_by_bytes(payload, content_size);
    if pieces.len() as u32 > max_chunks {
        return None;
    }
    let total = pieces.len();
    Some(
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| format!("[{}/{}] {}", i + 1, total, piece))
            .collect(),
    )
}

fn split_by_bytes(s: &str, max_len: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let mut cut = rest.len().min(max_len);
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.len().min(max_len);
        }
        let (piece, remainder) = rest.split_at(cut);
        out.push(piece);
        rest = remainder;
    }
    out
}

/// A parsed `[<seq>/<total>] <rest>` header, or the absence of one.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedChunk<'a> {
    pub seq: u32,
    pub total: u32,
    pub body: &'a str,
}

/// Parse a leading chunk header. Payloads without a recognizable header
/// are delivered as a single, complete chunk (`seq = total = 1`).
pub fn parse(payload: &str) -> ParsedChunk<'_> {
    if let Some(rest) = payload.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let header = &rest[..close];
            if let Some((seq_s, total_s)) = header.split_once('/') {
                if let (Ok(seq), Ok(total)) = (seq_s.parse(), total_s.parse()) {
                    let body = rest[close + 1..].strip_prefix(' ').unwrap_or(&rest[close + 1..]);
                    return ParsedChunk { seq, total, body };
                }
            }
        }
    }
    ParsedChunk {
        seq: 1,
        total: 1,
        body: payload,
    }
}

struct PendingChunks {
    total: u32,
    parts: HashMap<u32, String>,
    created: u64,
    last_chunk: u64,
}

/// Inbound fragment reassembly buffer, keyed by `(sender_node, total)`.
pub struct Reassembler {
    chunk_timeout: Duration,
    total_timeout: Duration,
    pending: HashMap<(String, u32), PendingChunks>,
}

impl Reassembler {
    pub fn new(chunk_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            chunk_timeout,
            total_timeout,
            pending: HashMap::new(),
        }
    }

    /// Feed one inbound fragment. `now_us` is the caller's monotonic clock
    /// in microseconds. Returns the fully reassembled payload once the
    /// last fragment arrives.
    pub fn feed(&mut self, sender_node: &str, payload: &str, now_us: u64) -> Option<String> {
        let parsed = parse(payload);
        if parsed.total <= 1 {
            return Some(parsed.body.to_string());
        }

        let key = (sender_node.to_string(), parsed.total);
        let entry = self.pending.entry(key.clone()).or_insert_with(|| PendingChunks {
            total: parsed.total,
            parts: HashMap::new(),
            created: now_us,
            last_chunk: now_us,
        });
        entry.parts.insert(parsed.seq, parsed.body.to_string());
        entry.last_chunk = now_us;

        if entry.parts.len() as u32 == entry.total {
            let entry = self.pending.remove(&key).unwrap();
            let mut assembled = String::new();
            for i in 1..=entry.total {
                assembled.push_str(entry.parts.get(&i).map(String::as_str).unwrap_or(""));
            }
            return Some(assembled);
        }
        None
    }

    /// Drop any buffer whose per-chunk or total timeout has elapsed.
    /// Whichever fires first wins; expiry is silent (no NAK, per spec).
    pub fn expire(&mut self, now_us: u64) {
        let chunk_timeout_us = self.chunk_timeout.as_micros() as u64;
        let total_timeout_us = self.total_timeout.as_micros() as u64;
        self.pending.retain(|_, entry| {
            let chunk_expired = now_us.saturating_sub(entry.last_chunk) > chunk_timeout_us;
            let total_expired = now_us.saturating_sub(entry.created) > total_timeout_us;
            !(chunk_expired || total_expired)
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
