//! Board sync: batch triggers, `BOARDREQ`/`ACK`/`NAK`/`DAT`/`DLV` flow,
//! per-UUID dedup and federated author tagging.
//!
//! Admin deletes are never propagated — boards are convergent-union only,
//! so this module only ever adds rows, never removes them on a peer's
//! say-so.

use std::collections::HashMap;

use meshbbs_core::chunker;
use meshbbs_core::config::Config;

use crate::error::{ProtoError, Result};
use crate::wire::{escape_user_content, unescape_user_content, Frame};

pub const BOARDREQ: &str = "BOARDREQ";
pub const BOARDACK: &str = "BOARDACK";
pub const BOARDNAK: &str = "BOARDNAK";
pub const BOARDDAT: &str = "BOARDDAT";
pub const BOARDDLV: &str = "BOARDDLV";

const RECORD_SEP: char = '\u{1F}'; // ASCII RS
const FIELD_SEP: char = '\u{1E}'; // ASCII GS

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub uuid: String,
    pub author: String,
    pub origin_bbs: String,
    pub timestamp_us: i64,
    pub subject: String,
    pub body: String,
}

impl PostRecord {
    fn encode(&self) -> String {
        [
            self.uuid.as_str(),
            self.author.as_str(),
            self.origin_bbs.as_str(),
            &self.timestamp_us.to_string(),
            self.subject.as_str(),
            self.body.as_str(),
        ]
        .join(&FIELD_SEP.to_string())
    }

    fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(FIELD_SEP).collect();
        let [uuid, author, origin_bbs, ts, subject, body] = fields[..] else {
            return Err(ProtoError::MalformedFrame);
        };
        Ok(Self {
            uuid: uuid.to_string(),
            author: author.to_string(),
            origin_bbs: origin_bbs.to_string(),
            timestamp_us: ts.parse().map_err(|_| ProtoError::MalformedFrame)?,
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }

    /// Author rewritten to `author@origin_bbs` if it carries no `@` yet.
    pub fn federated_author(&self) -> String {
        if self.author.contains('@') {
            self.author.clone()
        } else {
            format!("{}@{}", self.author, self.origin_bbs)
        }
    }
}

/// Encode a batch of posts as RS-joined, GS-delimited records, then split
/// across chunker-sized `BOARDDAT` fragments.
pub fn encode_batch(posts: &[PostRecord], cfg: &Config) -> Option<Vec<String>> {
    let joined = posts
        .iter()
        .map(PostRecord::encode)
        .collect::<Vec<_>>()
        .join(&RECORD_SEP.to_string());
    chunker::chunk(&joined, cfg.content_size(), cfg.board_max_chunks)
}

/// Decode a fully-reassembled batch payload back into post records.
pub fn decode_batch(payload: &str) -> Result<Vec<PostRecord>> {
    payload.split(RECORD_SEP).filter(|s| !s.is_empty()).map(PostRecord::parse).collect()
}

pub fn encode_boardreq(board: &str, count: u32, since_us: i64) -> Frame {
    Frame::new(BOARDREQ, format!("{board}|{count}|{since_us}"))
}

pub fn encode_boardack(board: &str) -> Frame {
    Frame::new(BOARDACK, board.to_string())
}

pub fn encode_boardnak(board: &str, reason: ProtoError) -> Frame {
    Frame::new(BOARDNAK, format!("{board}|{}", reason.nak_code()))
}

pub fn encode_boarddat(board: &str, part: u32, total: u32, payload: &str) -> Frame {
    Frame::new(BOARDDAT, format!("{board}|{part}/{total}|{}", escape_user_content(payload)))
}

pub fn parse_boarddat(payload: &str) -> Result<(String, u32, u32, String)> {
    let mut parts = payload.splitn(3, '|');
    let board = parts.next().ok_or(ProtoError::MalformedFrame)?.to_string();
    let part_total = parts.next().ok_or(ProtoError::MalformedFrame)?;
    let data = parts.next().unwrap_or("");
    let (part, total) = part_total.split_once('/').ok_or(ProtoError::MalformedFrame)?;
    Ok((
        board,
        part.parse().map_err(|_| ProtoError::MalformedFrame)?,
        total.parse().map_err(|_| ProtoError::MalformedFrame)?,
        unescape_user_content(data),
    ))
}

pub fn encode_boarddlv(board: &str) -> Frame {
    Frame::new(BOARDDLV, board.to_string())
}

/// Per-board, per-peer inbound batch reassembly.
#[derive(Default)]
pub struct BoardSyncEngine {
    incoming: HashMap<(String, String), IncomingBatch>,
    outgoing: HashMap<(String, String), OutgoingSync>,
}

#[derive(Default)]
struct IncomingBatch {
    parts: HashMap<u32, String>,
    total: u32,
}

/// Sender-side state for a batch push awaiting `BOARDACK`/`BOARDDLV`,
/// keyed by `(peer_callsign, board)`.
#[derive(Debug, Clone, Default)]
pub struct OutgoingSync {
    pub since_us: i64,
    /// Message UUIDs included once the batch has actually been sent
    /// (populated on `BOARDACK`, consumed on `BOARDDLV`).
    pub uuids: Vec<String>,
}

/// Whether a board accepts an inbound sync request: both the global
/// `sync.enabled` flag and the board's own `synced` flag must be truthy.
pub fn board_accepts_sync(sync_enabled: bool, board_synced: bool) -> bool {
    sync_enabled && board_synced
}

/// Whether a board may additionally be marked synced, given
/// `max_synced_boards`.
pub fn can_enable_sync(currently_synced: u32, max_synced_boards: u32) -> bool {
    currently_synced < max_synced_boards
}

impl BoardSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_boarddat(&mut self, peer_callsign: &str, board: &str, part: u32, total: u32, data: &str) -> Option<String> {
        let key = (peer_callsign.to_string(), board.to_string());
        let entry = self.incoming.entry(key.clone()).or_default();
        entry.total = total;
        entry.parts.insert(part, data.to_string());
        if entry.parts.len() as u32 == total {
            let entry = self.incoming.remove(&key).unwrap();
            let mut joined = String::new();
            for i in 1..=total {
                joined.push_str(entry.parts.get(&i).map(String::as_str).unwrap_or(""));
            }
            Some(joined)
        } else {
            None
        }
    }

    /// Batch trigger: fire when `pending_count >= batch_threshold`, or
    /// when `pending_count >= 1` and the interval has elapsed.
    pub fn should_sync(pending_count: u32, last_sync_at_us: i64, now_us: i64, cfg: &Config) -> bool {
        if pending_count >= cfg.batch_threshold {
            return true;
        }
        pending_count >= 1 && now_us.saturating_sub(last_sync_at_us) >= (cfg.batch_interval_secs as i64) * 1_000_000
    }

    /// Begin pushing `board` to `peer_callsign`: records the `since_us`
    /// watermark the eventual `BOARDDAT` batch was drawn from.
    pub fn begin_outgoing(&mut self, peer_callsign: &str, board: &str, since_us: i64) {
        self.outgoing.insert((peer_callsign.to_string(), board.to_string()), OutgoingSync { since_us, uuids: Vec::new() });
    }

    /// The `since_us` watermark recorded by [`Self::begin_outgoing`] for
    /// `(peer, board)`, if a push is currently in flight.
    pub fn since_us(&self, peer_callsign: &str, board: &str) -> Option<i64> {
        self.outgoing.get(&(peer_callsign.to_string(), board.to_string())).map(|o| o.since_us)
    }

    /// Record which UUIDs are actually included in the batch, once built
    /// in response to `BOARDACK`.
    pub fn record_outgoing_uuids(&mut self, peer_callsign: &str, board: &str, uuids: Vec<String>) {
        if let Some(entry) = self.outgoing.get_mut(&(peer_callsign.to_string(), board.to_string())) {
            entry.uuids = uuids;
        }
    }

    /// Remove and return the in-flight outgoing state for `(peer, board)`,
    /// on `BOARDDLV` (success) or `BOARDNAK` (abandon).
    pub fn take_outgoing(&mut self, peer_callsign: &str, board: &str) -> Option<OutgoingSync> {
        self.outgoing.remove(&(peer_callsign.to_string(), board.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_post() -> PostRecord {
        PostRecord {
            uuid: "u1".into(),
            author: "alice".into(),
            origin_bbs: "B0".into(),
            timestamp_us: 42,
            subject: "hi".into(),
            body: "hello board".into(),
        }
    }

    #[test]
    fn federated_author_tags_local_posts() {
        assert_eq!(sample_post().federated_author(), "alice@B0");
        let mut p = sample_post();
        p.author = "bob@B2".into();
        assert_eq!(p.federated_author(), "bob@B2");
    }

    #[test]
    fn batch_roundtrip() {
        let cfg = Config::default();
        let posts = vec![sample_post(), {
            let mut p = sample_post();
            p.uuid = "u2".into();
            p
        }];
        let chunks = encode_batch(&posts, &cfg).unwrap();
        let joined = chunks.iter().map(|c| chunker::parse(c).body).collect::<Vec<_>>().join("");
        let decoded = decode_batch(&joined).unwrap();
        assert_eq!(decoded, posts);
    }

    #[test]
    fn dedup_across_peers_same_uuid_stays_one_row() {
        // Simulated at the store layer: decode_batch never removes
        // duplicates itself (that's the store's insert_message dedup);
        // this only verifies the wire-level record is stable and
        // re-parseable for repeated delivery.
        let posts = vec![sample_post()];
        let cfg = Config::default();
        let chunks_a = encode_batch(&posts, &cfg).unwrap();
        let chunks_b = encode_batch(&posts, &cfg).unwrap();
        assert_eq!(chunks_a, chunks_b);
    }

    #[test]
    fn batch_trigger_on_threshold() {
        let cfg = Config::default();
        assert!(BoardSyncEngine::should_sync(cfg.batch_threshold, 0, 0, &cfg));
        assert!(!BoardSyncEngine::should_sync(1, 0, 0, &cfg));
    }

    #[test]
    fn batch_trigger_on_interval() {
        let cfg = Config::default();
        let elapsed = (cfg.batch_interval_secs as i64) * 1_000_000;
        assert!(BoardSyncEngine::should_sync(1, 0, elapsed, &cfg));
    }

    #[test]
    fn max_synced_boards_enforced() {
        assert!(can_enable_sync(2, 3));
        assert!(!can_enable_sync(3, 3));
    }

    #[test]
    fn outgoing_sync_tracked_until_delivered() {
        let mut engine = BoardSyncEngine::new();
        engine.begin_outgoing("B1", "general", 0);
        assert_eq!(engine.since_us("B1", "general"), Some(0));

        engine.record_outgoing_uuids("B1", "general", vec!["u1".to_string(), "u2".to_string()]);
        let outgoing = engine.take_outgoing("B1", "general").unwrap();
        assert_eq!(outgoing.uuids, vec!["u1".to_string(), "u2".to_string()]);
        assert!(engine.take_outgoing("B1", "general").is_none());
    }

    #[test]
    fn nak_drops_outgoing_state_without_uuids() {
        let mut engine = BoardSyncEngine::new();
        engine.begin_outgoing("B1", "general", 0);
        let outgoing = engine.take_outgoing("B1", "general").unwrap();
        assert!(outgoing.uuids.is_empty());
    }
}
