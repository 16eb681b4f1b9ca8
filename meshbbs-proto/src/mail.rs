//! Remote mail delivery: request / accept / data / confirm, with loop
//! prevention by route-set membership and multi-hop relaying.
//!
//! Pending deliveries are explicitly non-persistent (spec §3): this
//! module owns an in-memory table, mutated only from the scheduler's
//! cooperative context, never shared with a transport callback thread.

use std::collections::HashMap;
use std::time::Duration;

use meshbbs_core::chunker;
use meshbbs_core::config::Config;

use crate::error::{ProtoError, Result};
use crate::wire::{escape_user_content, unescape_user_content, Frame};

pub const MAILREQ: &str = "MAILREQ";
pub const MAILACK: &str = "MAILACK";
pub const MAILNAK: &str = "MAILNAK";
pub const MAILDAT: &str = "MAILDAT";
pub const MAILDLV: &str = "MAILDLV";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailReq {
    pub uuid: String,
    pub from_user: String,
    pub from_bbs: String,
    pub to_user: String,
    pub to_bbs: String,
    pub hop: u32,
    pub num_parts: u32,
    pub route: Vec<String>,
}

impl MailReq {
    pub fn encode(&self) -> Frame {
        Frame::new(
            MAILREQ,
            format!(
                "{}|{}|{}|{}|{}|{}|{}|{}",
                self.uuid,
                self.from_user,
                self.from_bbs,
                self.to_user,
                self.to_bbs,
                self.hop,
                self.num_parts,
                self.route.join(",")
            ),
        )
    }

    pub fn parse(payload: &str) -> Result<Self> {
        let fields: Vec<&str> = payload.split('|').collect();
        let [uuid, from_user, from_bbs, to_user, to_bbs, hop, num_parts, route_csv] = fields[..] else {
            return Err(ProtoError::MalformedFrame);
        };
        Ok(Self {
            uuid: uuid.to_string(),
            from_user: from_user.to_string(),
            from_bbs: from_bbs.to_string(),
            to_user: to_user.to_string(),
            to_bbs: to_bbs.to_string(),
            hop: hop.parse().map_err(|_| ProtoError::MalformedFrame)?,
            num_parts: num_parts.parse().map_err(|_| ProtoError::MalformedFrame)?,
            route: if route_csv.is_empty() {
                Vec::new()
            } else {
                route_csv.split(',').map(str::to_string).collect()
            },
        })
    }
}

pub fn encode_mailack(uuid: &str) -> Frame {
    Frame::new(MAILACK, format!("{uuid}|OK"))
}

pub fn encode_mailnak(uuid: &str, reason: ProtoError) -> Frame {
    Frame::new(MAILNAK, format!("{uuid}|{}", reason.nak_code()))
}

pub fn encode_maildat(uuid: &str, part: u32, total: u32, payload: &str) -> Frame {
    Frame::new(MAILDAT, format!("{uuid}|{part}/{total}|{}", escape_user_content(payload)))
}

pub fn parse_maildat(payload: &str) -> Result<(String, u32, u32, String)> {
    let mut parts = payload.splitn(3, '|');
    let uuid = parts.next().ok_or(ProtoError::MalformedFrame)?.to_string();
    let part_total = parts.next().ok_or(ProtoError::MalformedFrame)?;
    let data = parts.next().unwrap_or("");
    let (part, total) = part_total.split_once('/').ok_or(ProtoError::MalformedFrame)?;
    Ok((
        uuid,
        part.parse().map_err(|_| ProtoError::MalformedFrame)?,
        total.parse().map_err(|_| ProtoError::MalformedFrame)?,
        unescape_user_content(data),
    ))
}

pub fn encode_maildlv(uuid: &str, recipient_addr: &str) -> Frame {
    Frame::new(MAILDLV, format!("{uuid}|OK|{recipient_addr}"))
}

/// Sender-side in-flight delivery state.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub uuid: String,
    pub from_node_id: String,
    pub from_user: String,
    pub from_bbs: String,
    pub to_user: String,
    pub to_bbs: String,
    pub next_hop_node_id: String,
    pub chunks: Vec<String>,
    pub state: DeliveryState,
    pub attempt: u32,
    pub last_activity_us: i64,
    pub created_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    AwaitingAck,
    SendingChunks,
    Delivered,
    Failed,
    Expired,
}

/// One action the caller must carry out as a result of [`MailEngine::sweep`].
#[derive(Debug)]
pub enum DeliveryAction {
    /// Resend the original `MAILREQ` to `next_hop_node_id` — the ack timer
    /// elapsed with no `MAILACK`/`MAILNAK` yet.
    Resend { frame: Frame, next_hop_node_id: String },
    /// The delivery aged past `pending_delivery_expiry_secs` (or exhausted
    /// its retry budget) without completing.
    Expired { uuid: String, from_node_id: String, to_user: String, to_bbs: String },
}

/// Receiver/relay-side reassembly state for an inbound `MAILDAT` stream.
#[derive(Debug, Clone, Default)]
pub struct IncomingMail {
    pub parts: HashMap<u32, String>,
    pub num_parts: u32,
    pub from_user: String,
    pub from_bbs: String,
    pub to_user: String,
    /// Present only when relaying: the peer to forward chunks to.
    pub relay_to_node_id: Option<String>,
    pub return_path_node_id: String,
}

#[derive(Default)]
pub struct MailEngine {
    pub pending: HashMap<String, PendingDelivery>,
    pub incoming: HashMap<String, IncomingMail>,
}

pub enum SenderFailure {
    NoRouteToBbs,
    Looped,
}

impl MailEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose an outbound message, chunking the body and returning the
    /// initial `MAILREQ` to send, or a local failure if the body is too
    /// long or there is no route to the destination.
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        &mut self,
        cfg: &Config,
        uuid: String,
        from_node_id: &str,
        from_user: &str,
        from_bbs: &str,
        to_user: &str,
        to_bbs: &str,
        next_hop_node_id: String,
        body: &str,
        now_us: i64,
    ) -> std::result::Result<Frame, ProtoError> {
        if body.len() > cfg.remote_body_max {
            return Err(ProtoError::RemoteBodyTooLong);
        }
        let chunks = chunker::chunk(body, cfg.content_size(), cfg.mail_max_chunks).ok_or(ProtoError::RemoteBodyTooLong)?;
        let req = MailReq {
            uuid: uuid.clone(),
            from_user: from_user.to_string(),
            from_bbs: from_bbs.to_string(),
            to_user: to_user.to_string(),
            to_bbs: to_bbs.to_string(),
            hop: 1,
            num_parts: chunks.len() as u32,
            route: vec![from_bbs.to_string()],
        };
        self.pending.insert(
            uuid,
            PendingDelivery {
                uuid: req.uuid.clone(),
                from_node_id: from_node_id.to_string(),
                from_user: from_user.to_string(),
                from_bbs: from_bbs.to_string(),
                to_user: to_user.to_string(),
                to_bbs: to_bbs.to_string(),
                next_hop_node_id,
                chunks,
                state: DeliveryState::AwaitingAck,
                attempt: 0,
                last_activity_us: now_us,
                created_us: now_us,
            },
        );
        Ok(req.encode())
    }

    /// Receiver/relay side: decide how to handle an inbound `MAILREQ`
    /// from peer `from_node_id`. The caller supplies `my_callsign`,
    /// whether `to_user` is registered locally (when terminal), and the
    /// next-hop lookup result (when relaying).
    pub fn on_mailreq(
        &mut self,
        req: &MailReq,
        my_callsign: &str,
        max_hops: u32,
        from_node_id: &str,
        recipient_registered: impl FnOnce(&str) -> bool,
        next_hop_for: impl FnOnce(&str) -> Option<String>,
    ) -> std::result::Result<MailReqOutcome, ProtoError> {
        if req.route.iter().any(|c| c.eq_ignore_ascii_case(my_callsign)) {
            return Err(ProtoError::Looped);
        }
        let is_terminal = req.to_bbs.eq_ignore_ascii_case(my_callsign);
        // A relay would forward with hop+1, so hop == max_hops already
        // exceeds the bound for it; a terminal accepts up to and
        // including max_hops since it never increments further.
        let hops_exceeded = if is_terminal { req.hop > max_hops } else { req.hop >= max_hops };
        if hops_exceeded {
            return Err(ProtoError::MaxHopsExceeded);
        }
        if is_terminal {
            if !recipient_registered(&req.to_user) {
                return Err(ProtoError::RecipientUnknown);
            }
            self.incoming.insert(
                req.uuid.clone(),
                IncomingMail {
                    parts: HashMap::new(),
                    num_parts: req.num_parts,
                    from_user: req.from_user.clone(),
                    from_bbs: req.from_bbs.clone(),
                    to_user: req.to_user.clone(),
                    relay_to_node_id: None,
                    return_path_node_id: from_node_id.to_string(),
                },
            );
            Ok(MailReqOutcome::Terminal)
        } else {
            let Some(next_hop) = next_hop_for(&req.to_bbs) else {
                return Err(ProtoError::NoRouteToBbs);
            };
            let mut forwarded = req.clone();
            forwarded.hop += 1;
            forwarded.route.push(my_callsign.to_string());
            self.incoming.insert(
                req.uuid.clone(),
                IncomingMail {
                    parts: HashMap::new(),
                    num_parts: req.num_parts,
                    from_user: req.from_user.clone(),
                    from_bbs: req.from_bbs.clone(),
                    to_user: req.to_user.clone(),
                    relay_to_node_id: Some(next_hop.clone()),
                    return_path_node_id: from_node_id.to_string(),
                },
            );
            Ok(MailReqOutcome::Relay { next_hop_node_id: next_hop, forwarded })
        }
    }

    /// Feed one inbound `MAILDAT` chunk. Returns the fully assembled body
    /// once the last part arrives (terminal side only; relay chunks are
    /// forwarded opaquely by the caller without buffering here).
    pub fn on_maildat(&mut self, uuid: &str, part: u32, total: u32, data: &str) -> Option<String> {
        let entry = self.incoming.get_mut(uuid)?;
        entry.num_parts = total;
        entry.parts.insert(part, data.to_string());
        if entry.parts.len() as u32 == total {
            let mut body = String::new();
            for i in 1..=total {
                body.push_str(entry.parts.get(&i).map(String::as_str).unwrap_or(""));
            }
            Some(body)
        } else {
            None
        }
    }

    /// Retry backoff for the given zero-based retry attempt (0 = first
    /// resend after the initial ack-timeout elapses).
    pub fn next_backoff(cfg: &Config, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(cfg.mail_retry_backoff_secs.len().saturating_sub(1));
        Duration::from_secs(cfg.mail_retry_backoff_secs.get(idx).copied().unwrap_or(60))
    }

    /// Advance all sender-side pending deliveries: resend a `MAILREQ` whose
    /// ack timer (or subsequent backoff) elapsed, or expire it once the
    /// total delivery window or the retry budget is exhausted. Expired
    /// entries are removed from `pending`.
    pub fn sweep(&mut self, cfg: &Config, now_us: i64) -> Vec<DeliveryAction> {
        let total_expiry_us = (cfg.pending_delivery_expiry_secs as i64) * 1_000_000;
        let mut actions = Vec::new();
        let mut expired = Vec::new();
        for (uuid, delivery) in self.pending.iter_mut() {
            if delivery.state != DeliveryState::AwaitingAck {
                continue;
            }
            if now_us - delivery.created_us >= total_expiry_us || delivery.attempt >= cfg.mail_retry_attempts {
                delivery.state = DeliveryState::Expired;
                expired.push(uuid.clone());
                actions.push(DeliveryAction::Expired {
                    uuid: uuid.clone(),
                    from_node_id: delivery.from_node_id.clone(),
                    to_user: delivery.to_user.clone(),
                    to_bbs: delivery.to_bbs.clone(),
                });
                continue;
            }
            let wait = if delivery.attempt == 0 {
                cfg.mail_ack_timeout()
            } else {
                Self::next_backoff(cfg, delivery.attempt - 1)
            };
            if now_us - delivery.last_activity_us >= wait.as_micros() as i64 {
                let req = MailReq {
                    uuid: delivery.uuid.clone(),
                    from_user: delivery.from_user.clone(),
                    from_bbs: delivery.from_bbs.clone(),
                    to_user: delivery.to_user.clone(),
                    to_bbs: delivery.to_bbs.clone(),
                    hop: 1,
                    num_parts: delivery.chunks.len() as u32,
                    route: vec![delivery.from_bbs.clone()],
                };
                delivery.attempt += 1;
                delivery.last_activity_us = now_us;
                actions.push(DeliveryAction::Resend {
                    frame: req.encode(),
                    next_hop_node_id: delivery.next_hop_node_id.clone(),
                });
            }
        }
        for uuid in expired {
            self.pending.remove(&uuid);
        }
        actions
    }
}

#[derive(Debug)]
pub enum MailReqOutcome {
    Terminal,
    Relay { next_hop_node_id: String, forwarded: MailReq },
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbbs_core::config::Config;

    #[test]
    fn mailreq_roundtrips() {
        let req = MailReq {
            uuid: "u1".into(),
            from_user: "u0".into(),
            from_bbs: "B0".into(),
            to_user: "u4".into(),
            to_bbs: "B4".into(),
            hop: 2,
            num_parts: 1,
            route: vec!["B0".into(), "B1".into()],
        };
        let frame = req.encode();
        let parsed = MailReq::parse(&frame.payload).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn loop_detected_at_hop_one() {
        let mut engine = MailEngine::new();
        let req = MailReq {
            uuid: "u1".into(),
            from_user: "u0".into(),
            from_bbs: "B0".into(),
            to_user: "u4".into(),
            to_bbs: "B4".into(),
            hop: 1,
            num_parts: 1,
            route: vec!["B1".into()],
        };
        let err = engine
            .on_mailreq(&req, "B1", 5, "!nodeX", |_| true, |_| None)
            .unwrap_err();
        assert_eq!(err, ProtoError::Looped);
    }

    #[test]
    fn maxhops_rejected_at_relay_but_accepted_at_terminal() {
        let mut engine = MailEngine::new();
        let mut req = MailReq {
            uuid: "u1".into(),
            from_user: "u0".into(),
            from_bbs: "B0".into(),
            to_user: "u4".into(),
            to_bbs: "B4".into(),
            hop: 5,
            num_parts: 1,
            route: vec!["B0".into()],
        };
        // relay: not the terminal bbs
        let err = engine
            .on_mailreq(&req, "B2", 5, "!nodeX", |_| true, |_| Some("!next".into()))
            .unwrap_err();
        assert_eq!(err, ProtoError::MaxHopsExceeded);

        // terminal: same hop count is accepted
        req.to_bbs = "B2".into();
        let outcome = engine.on_mailreq(&req, "B2", 5, "!nodeX", |_| true, |_| None).unwrap();
        assert!(matches!(outcome, MailReqOutcome::Terminal));
    }

    #[test]
    fn terminal_reassembles_single_chunk_body() {
        let mut engine = MailEngine::new();
        let req = MailReq {
            uuid: "u1".into(),
            from_user: "u0".into(),
            from_bbs: "B0".into(),
            to_user: "u4".into(),
            to_bbs: "B4".into(),
            hop: 4,
            num_parts: 1,
            route: vec!["B0".into(), "B1".into(), "B2".into(), "B3".into()],
        };
        engine.on_mailreq(&req, "B4", 5, "!node3", |_| true, |_| None).unwrap();
        let body = engine.on_maildat("u1", 1, 1, "hi");
        assert_eq!(body.as_deref(), Some("hi"));
    }

    #[test]
    fn unknown_recipient_yields_nouser() {
        let mut engine = MailEngine::new();
        let req = MailReq {
            uuid: "u1".into(),
            from_user: "u0".into(),
            from_bbs: "B0".into(),
            to_user: "ghost".into(),
            to_bbs: "B4".into(),
            hop: 1,
            num_parts: 1,
            route: vec!["B0".into()],
        };
        let err = engine
            .on_mailreq(&req, "B4", 5, "!node0", |_| false, |_| None)
            .unwrap_err();
        assert_eq!(err, ProtoError::RecipientUnknown);
        assert_eq!(err.nak_code(), "NOUSER");
    }

    #[test]
    fn oversized_body_is_rejected_distinctly() {
        let mut engine = MailEngine::new();
        let cfg = Config::default();
        let body = "x".repeat(cfg.remote_body_max + 1);
        let err = engine
            .compose(&cfg, "u1".into(), "!node0", "alice", "B0", "bob", "B4", "!node1".into(), &body, 0)
            .unwrap_err();
        assert_eq!(err, ProtoError::RemoteBodyTooLong);
        assert_eq!(err.nak_code(), "TOO_LONG");
    }

    #[test]
    fn sweep_resends_after_ack_timeout_then_expires_on_retry_budget() {
        let mut engine = MailEngine::new();
        let cfg = Config::default();
        assert_eq!(cfg.mail_retry_attempts, 3);
        engine
            .compose(&cfg, "u1".into(), "!node0", "alice", "B0", "bob", "B4", "!node1".into(), "hi", 0)
            .unwrap();

        // Not yet due.
        assert!(engine.sweep(&cfg, 1_000_000).is_empty());

        // First resend, at the ack timeout (30s).
        let actions = engine.sweep(&cfg, 30_000_000);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], DeliveryAction::Resend { .. }));
        assert_eq!(engine.pending.get("u1").unwrap().attempt, 1);

        // Second resend, after the first backoff (60s later).
        engine.sweep(&cfg, 90_000_000);
        assert_eq!(engine.pending.get("u1").unwrap().attempt, 2);

        // Third resend, after the second backoff (120s later).
        engine.sweep(&cfg, 210_000_000);
        assert_eq!(engine.pending.get("u1").unwrap().attempt, 3);

        // Retry budget exhausted: the next sweep expires it immediately.
        let actions = engine.sweep(&cfg, 210_000_001);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], DeliveryAction::Expired { .. }));
        assert!(!engine.pending.contains_key("u1"));
    }

    #[test]
    fn sweep_expires_on_total_delivery_window() {
        let mut engine = MailEngine::new();
        let cfg = Config::default();
        engine
            .compose(&cfg, "u1".into(), "!node0", "alice", "B0", "bob", "B4", "!node1".into(), "hi", 0)
            .unwrap();

        let past_expiry_us = (cfg.pending_delivery_expiry_secs as i64) * 1_000_000 + 1;
        let actions = engine.sweep(&cfg, past_expiry_us);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DeliveryAction::Expired { uuid, from_node_id, .. } => {
                assert_eq!(uuid, "u1");
                assert_eq!(from_node_id, "!node0");
            }
            other => panic!("expected Expired, got {other:?}"),
        }
        assert!(!engine.pending.contains_key("u1"));
    }

    #[test]
    fn sweep_ignores_deliveries_not_awaiting_ack() {
        let mut engine = MailEngine::new();
        let cfg = Config::default();
        engine
            .compose(&cfg, "u1".into(), "!node0", "alice", "B0", "bob", "B4", "!node1".into(), "hi", 0)
            .unwrap();
        engine.pending.get_mut("u1").unwrap().state = DeliveryState::Delivered;

        let far_future = (cfg.pending_delivery_expiry_secs as i64) * 1_000_000 * 10;
        assert!(engine.sweep(&cfg, far_future).is_empty());
        assert!(engine.pending.contains_key("u1"));
    }
}
