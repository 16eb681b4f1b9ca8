//! Wires the protocol-agnostic kernel (`meshbbs-core`), the federation
//! plane (`meshbbs-proto`), sessions, the command dispatcher, and the
//! scheduler into one runnable BBS instance. The radio transport itself
//! stays a caller-supplied collaborator (see [`transport::Transport`]).

pub mod dev_tracing;
pub mod dispatcher;
pub mod error;
pub mod housekeeping;
pub mod scheduler;
pub mod session;
pub mod transport;

use meshbbs_core::chunker::Reassembler;
use meshbbs_core::config::Config;
use meshbbs_core::crypto::MasterKey;
use meshbbs_core::store::Store;
use meshbbs_proto::board::{self, BoardSyncEngine};
use meshbbs_proto::federation::{self, Route};
use meshbbs_proto::mail::{self, DeliveryAction, MailEngine, MailReqOutcome};
use meshbbs_proto::rap;
use meshbbs_proto::wire::Frame;
use tracing::{info, warn};

use crate::scheduler::Tick;

use dispatcher::{Deps, DispatchOutcome, Dispatcher};
use error::Result;
use session::SessionManager;

pub mod prelude {
    pub use crate::dispatcher::{DispatchOutcome, Dispatcher};
    pub use crate::error::{BbsError, Result};
    pub use crate::scheduler::Scheduler;
    pub use crate::session::SessionManager;
    pub use crate::transport::{AckOutcome, AckSignal, Inbound, Transport};
    pub use crate::BbsInstance;
}

/// One running BBS instance: store, master key, the federation engines,
/// sessions, and the command dispatcher. Does not own a transport or a
/// scheduler loop — callers drive both against the outbound frames this
/// returns.
pub struct BbsInstance {
    pub store: Store,
    pub master: MasterKey,
    pub cfg: Config,
    pub sessions: SessionManager,
    pub mail: MailEngine,
    pub boards: BoardSyncEngine,
    pub dispatcher: Dispatcher,
    reassembler: Reassembler,
}

/// One frame (or dispatcher reply) that must go out to `to_node_id`.
pub struct Outbound {
    pub to_node_id: String,
    pub text: String,
}

impl BbsInstance {
    /// Open `store`, derive the master key from `passphrase`, and ensure
    /// the default boards exist.
    pub fn new(cfg: Config, store: Store, passphrase: &str, now_us: i64) -> Result<Self> {
        let salt = store.master_key_salt()?;
        let master = MasterKey::derive(passphrase, &salt, &cfg.kdf)?;
        dispatcher::ensure_default_boards(&store, &master, now_us)?;
        let reassembler = Reassembler::new(cfg.chunk_timeout(), cfg.chunk_total_timeout());
        Ok(Self {
            store,
            master,
            cfg,
            sessions: SessionManager::new(),
            mail: MailEngine::new(),
            boards: BoardSyncEngine::new(),
            dispatcher: Dispatcher::new(),
            reassembler,
        })
    }

    fn is_peer(&self, node_id: &str) -> bool {
        self.cfg.peers.iter().any(|p| p.node_id == node_id && p.enabled)
    }

    fn peer_callsign(&self, node_id: &str) -> Option<&str> {
        self.cfg.peers.iter().find(|p| p.node_id == node_id).map(|p| p.callsign.as_str())
    }

    /// Handle one inbound fragment from `sender_node`: feeds it through the
    /// chunk reassembler and, once a complete frame text is available,
    /// routes it. Most fragments are single-chunk and route immediately.
    pub fn handle_inbound(&mut self, sender_node: &str, payload: &str, now_us: i64) -> Vec<Outbound> {
        let Some(assembled) = self.reassembler.feed(sender_node, payload, now_us as u64) else {
            return Vec::new();
        };
        self.route_inbound(sender_node, &assembled, now_us)
    }

    fn route_inbound(&mut self, sender_node: &str, payload: &str, now_us: i64) -> Vec<Outbound> {
        let is_peer = self.is_peer(sender_node);
        let route = match federation::route(payload, is_peer) {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };

        match route {
            Route::Command(cmd) => {
                let mut deps = Deps {
                    store: &self.store,
                    master: &self.master,
                    cfg: &self.cfg,
                    sessions: &mut self.sessions,
                    mail: &mut self.mail,
                    my_callsign: &self.cfg.callsign,
                };
                let outcome: DispatchOutcome = self.dispatcher.dispatch(&mut deps, sender_node, &format!("!{cmd}"), now_us);
                self.outcome_to_outbound(sender_node, outcome)
            }
            Route::Rap(frame) => self.handle_rap(sender_node, frame, now_us),
            Route::Mail(frame) => self.handle_mail(sender_node, frame, now_us),
            Route::Board(frame) => self.handle_board(sender_node, frame, now_us),
            Route::Ignored => Vec::new(),
        }
    }

    /// Handle a plain (non-`!`) line of text, honoring the dispatcher's
    /// implicit reply/post context.
    pub fn handle_plaintext(&mut self, sender_node: &str, text: &str, now_us: i64) -> Vec<Outbound> {
        let mut deps = Deps {
            store: &self.store,
            master: &self.master,
            cfg: &self.cfg,
            sessions: &mut self.sessions,
            mail: &mut self.mail,
            my_callsign: &self.cfg.callsign,
        };
        let outcome = self.dispatcher.dispatch(&mut deps, sender_node, text, now_us);
        self.outcome_to_outbound(sender_node, outcome)
    }

    fn outcome_to_outbound(&self, sender_node: &str, outcome: DispatchOutcome) -> Vec<Outbound> {
        let mut out: Vec<Outbound> = outcome
            .outbound
            .into_iter()
            .map(|(to, text)| Outbound { to_node_id: to, text })
            .collect();
        if let Some(reply) = outcome.reply {
            out.push(Outbound {
                to_node_id: sender_node.to_string(),
                text: reply,
            });
        }
        out
    }

    fn handle_rap(&mut self, sender_node: &str, frame: Frame, now_us: i64) -> Vec<Outbound> {
        let Some(peer_callsign) = self.peer_callsign(sender_node) else {
            warn!(sender_node, "RAP frame from a node with no configured callsign");
            return Vec::new();
        };
        let peer_callsign = peer_callsign.to_string();
        match frame.frame_type.as_str() {
            rap::PING => match rap::on_ping(&self.store, sender_node, &peer_callsign, &self.cfg.callsign, now_us) {
                Ok(out) => vec![Outbound {
                    to_node_id: out.to_node_id,
                    text: out.frame.encode(),
                }],
                Err(_) => Vec::new(),
            },
            rap::PONG | rap::ROUTES => {
                let table = frame.payload.split_once('|').map(|(_, t)| t).unwrap_or(&frame.payload);
                let _ = rap::on_pong_or_routes(&self.store, sender_node, &peer_callsign, &self.cfg.callsign, table, &self.cfg, now_us);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_mail(&mut self, sender_node: &str, frame: Frame, now_us: i64) -> Vec<Outbound> {
        let to = |node: String, text: String| Outbound { to_node_id: node, text };
        match frame.frame_type.as_str() {
            mail::MAILREQ => {
                let Ok(req) = mail::MailReq::parse(&frame.payload) else {
                    return Vec::new();
                };
                let store = &self.store;
                let outcome = self.mail.on_mailreq(
                    &req,
                    &self.cfg.callsign,
                    self.cfg.max_hops as u32,
                    sender_node,
                    |to_user| store.find_user_by_name(to_user).map(|o| o.is_some()).unwrap_or(false),
                    |to_bbs| rap::lookup_next_hop(store, to_bbs).ok().flatten(),
                );
                match outcome {
                    Ok(MailReqOutcome::Terminal) => vec![to(sender_node.to_string(), mail::encode_mailack(&req.uuid).encode())],
                    Ok(MailReqOutcome::Relay { next_hop_node_id, forwarded }) => vec![to(next_hop_node_id, forwarded.encode().encode())],
                    Err(e) => vec![to(sender_node.to_string(), mail::encode_mailnak(&req.uuid, e).encode())],
                }
            }
            mail::MAILACK => {
                let uuid = frame.payload.split('|').next().unwrap_or("").to_string();
                if let Some(pending) = self.mail.pending.get_mut(&uuid) {
                    pending.state = mail::DeliveryState::SendingChunks;
                    let total = pending.chunks.len() as u32;
                    let next_hop = pending.next_hop_node_id.clone();
                    pending
                        .chunks
                        .iter()
                        .enumerate()
                        .map(|(i, c)| to(next_hop.clone(), mail::encode_maildat(&uuid, i as u32 + 1, total, c).encode()))
                        .collect()
                } else if let Some(incoming) = self.mail.incoming.get(&uuid) {
                    vec![to(incoming.return_path_node_id.clone(), frame.encode())]
                } else {
                    Vec::new()
                }
            }
            mail::MAILNAK => {
                let uuid = frame.payload.split('|').next().unwrap_or("");
                if let Some(pending) = self.mail.pending.get_mut(uuid) {
                    pending.state = mail::DeliveryState::Failed;
                    Vec::new()
                } else if let Some(incoming) = self.mail.incoming.get(uuid) {
                    vec![to(incoming.return_path_node_id.clone(), frame.encode())]
                } else {
                    Vec::new()
                }
            }
            mail::MAILDAT => {
                let Ok((uuid, part, total, data)) = mail::parse_maildat(&frame.payload) else {
                    return Vec::new();
                };
                let relay_target = self.mail.incoming.get(&uuid).and_then(|i| i.relay_to_node_id.clone());
                if let Some(next_hop) = relay_target {
                    return vec![to(next_hop, mail::encode_maildat(&uuid, part, total, &data).encode())];
                }
                let Some(body) = self.mail.on_maildat(&uuid, part, total, &data) else {
                    return Vec::new();
                };
                let Some(incoming) = self.mail.incoming.get(&uuid).cloned() else {
                    return Vec::new();
                };
                self.deliver_terminal_mail(&uuid, &incoming, &body, now_us);
                vec![to(incoming.return_path_node_id.clone(), mail::encode_maildlv(&uuid, &format!("{}@{}", incoming.to_user, self.cfg.callsign)).encode())]
            }
            mail::MAILDLV => {
                let uuid = frame.payload.split('|').next().unwrap_or("").to_string();
                if let Some(pending) = self.mail.pending.get_mut(&uuid) {
                    pending.state = mail::DeliveryState::Delivered;
                    Vec::new()
                } else if let Some(incoming) = self.mail.incoming.get(&uuid) {
                    vec![to(incoming.return_path_node_id.clone(), frame.encode())]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn deliver_terminal_mail(&self, uuid: &str, incoming: &mail::IncomingMail, body: &str, now_us: i64) {
        use meshbbs_core::crypto;
        use meshbbs_core::store::{MessageKind, NewMessage};
        use uuid::Uuid;

        let Ok(parsed_uuid) = Uuid::parse_str(uuid) else { return };
        let Ok(Some(recipient)) = self.store.find_user_by_name(&incoming.to_user) else {
            return;
        };
        let Ok(key) = self.master.unwrap(&recipient.wrapped_key) else { return };
        let ciphertext = crypto::encrypt(&key, &parsed_uuid, now_us, body.as_bytes());
        let _ = self.store.insert_message(&NewMessage {
            uuid: parsed_uuid,
            kind: MessageKind::Mail,
            sender_user_id: None,
            recipient_user_id: Some(recipient.id),
            board_name: None,
            author: Some(incoming.from_user.clone()),
            origin_bbs: incoming.from_bbs.clone(),
            subject_ciphertext: None,
            body_ciphertext: ciphertext,
            created_at_us: now_us,
            expires_at_us: None,
        });
    }

    fn handle_board(&mut self, sender_node: &str, frame: Frame, now_us: i64) -> Vec<Outbound> {
        let Some(peer_callsign) = self.peer_callsign(sender_node).map(str::to_string) else {
            return Vec::new();
        };
        let to = |text: String| Outbound {
            to_node_id: sender_node.to_string(),
            text,
        };
        match frame.frame_type.as_str() {
            board::BOARDREQ => {
                let mut parts = frame.payload.splitn(3, '|');
                let Some(name) = parts.next() else { return Vec::new() };
                match self.store.find_board(name) {
                    Ok(Some(b)) if board::board_accepts_sync(self.cfg.sync_enabled, b.synced) => {
                        vec![to(board::encode_boardack(name).encode())]
                    }
                    Ok(Some(_)) => vec![to(board::encode_boardnak(name, meshbbs_proto::error::ProtoError::SyncDisabledForBoard).encode())],
                    _ => vec![to(board::encode_boardnak(name, meshbbs_proto::error::ProtoError::UnknownBoard).encode())],
                }
            }
            board::BOARDDAT => {
                let Ok((board_name, part, total, data)) = board::parse_boarddat(&frame.payload) else {
                    return Vec::new();
                };
                let Some(joined) = self.boards.on_boarddat(&peer_callsign, &board_name, part, total, &data) else {
                    return Vec::new();
                };
                let Ok(posts) = board::decode_batch(&joined) else { return Vec::new() };
                let Ok(Some(b)) = self.store.find_board(&board_name) else {
                    return Vec::new();
                };
                let Ok(board_key) = self.master.unwrap(&b.wrapped_key) else { return Vec::new() };
                for post in posts {
                    self.insert_synced_post(&board_name, &post, &board_key, now_us);
                }
                vec![to(board::encode_boarddlv(&board_name).encode())]
            }
            board::BOARDACK => {
                let board_name = frame.payload.clone();
                self.send_board_batch(&peer_callsign, sender_node, &board_name, now_us)
            }
            board::BOARDNAK => {
                let board_name = frame.payload.split('|').next().unwrap_or("").to_string();
                if self.boards.take_outgoing(&peer_callsign, &board_name).is_some() {
                    warn!(board = %board_name, peer = %peer_callsign, "peer declined board sync");
                }
                Vec::new()
            }
            board::BOARDDLV => {
                let board_name = frame.payload.clone();
                if let Some(outgoing) = self.boards.take_outgoing(&peer_callsign, &board_name) {
                    for uuid in &outgoing.uuids {
                        if let Ok(parsed) = uuid::Uuid::parse_str(uuid) {
                            let _ = self.store.mark_sync_acked(&parsed, &peer_callsign, "out");
                        }
                    }
                    let _ = self.store.reset_pending(&board_name, now_us);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// After a peer `BOARDACK`s our `BOARDREQ` for `board_name`: pull the
    /// posts since the watermark recorded in `begin_outgoing`, encode them
    /// into `BOARDDAT` chunks, and send them.
    fn send_board_batch(&mut self, peer_callsign: &str, to_node: &str, board_name: &str, now_us: i64) -> Vec<Outbound> {
        let Some(since_us) = self.boards.since_us(peer_callsign, board_name) else {
            return Vec::new();
        };
        let Ok(Some(b)) = self.store.find_board(board_name) else { return Vec::new() };
        let Ok(board_key) = self.master.unwrap(&b.wrapped_key) else { return Vec::new() };
        let Ok(posts) = self.store.board_posts(board_name, self.cfg.batch_threshold.max(1), since_us) else {
            return Vec::new();
        };
        if posts.is_empty() {
            return Vec::new();
        }
        let mut records = Vec::new();
        let mut uuids = Vec::new();
        for msg in &posts {
            let Ok(plain) = meshbbs_core::crypto::decrypt(&board_key, &msg.uuid, msg.created_at_us, &msg.body_ciphertext) else {
                continue;
            };
            uuids.push(msg.uuid.to_string());
            records.push(board::PostRecord {
                uuid: msg.uuid.to_string(),
                author: msg.author.clone().unwrap_or_default(),
                origin_bbs: msg.origin_bbs.clone(),
                timestamp_us: msg.created_at_us,
                subject: String::new(),
                body: String::from_utf8_lossy(&plain).to_string(),
            });
        }
        let Some(chunks) = board::encode_batch(&records, &self.cfg) else {
            return Vec::new();
        };
        self.boards.record_outgoing_uuids(peer_callsign, board_name, uuids.clone());
        for uuid in &uuids {
            if let Ok(parsed) = uuid::Uuid::parse_str(uuid) {
                let _ = self.store.record_sync_attempt(&parsed, peer_callsign, "out", now_us);
            }
        }
        let total = chunks.len() as u32;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| Outbound {
                to_node_id: to_node.to_string(),
                text: board::encode_boarddat(board_name, i as u32 + 1, total, &c).encode(),
            })
            .collect()
    }

    /// Act on one scheduler [`Tick`], returning any frames that must go out.
    pub fn on_tick(&mut self, tick: Tick, now_us: i64) -> Vec<Outbound> {
        match tick {
            Tick::RapHeartbeat => self.on_heartbeat_tick(now_us),
            Tick::RapRouteShare => self.on_route_share_tick(),
            Tick::RouteExpiry => {
                match self.store.expire_routes(now_us) {
                    Ok(n) if n > 0 => info!(n, "expired stale routes"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "route expiry failed"),
                }
                Vec::new()
            }
            Tick::ChunkCleanup => {
                self.reassembler.expire(now_us as u64);
                Vec::new()
            }
            Tick::DeliverySweep => self.on_delivery_sweep_tick(now_us),
            Tick::BoardSyncCheck => self.on_board_sync_tick(now_us),
            Tick::ExpireMessages => {
                match self.store.expire_messages(now_us) {
                    Ok(n) if n > 0 => info!(n, "expired stale messages"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "message expiry failed"),
                }
                Vec::new()
            }
            // No grounded wire frame (announcement/capability broadcast) or
            // backup mechanism exists elsewhere in this codebase to drive
            // from; left unimplemented rather than invented.
            Tick::Announcement | Tick::Backup => Vec::new(),
        }
    }

    fn on_heartbeat_tick(&mut self, now_us: i64) -> Vec<Outbound> {
        let timeout_us = (self.cfg.heartbeat_timeout_secs as i64) * 1_000_000;
        if let Ok(peers) = self.store.all_peers() {
            for peer in &peers {
                if !peer.enabled || peer.health == rap::PeerHealth::Dead.as_str() {
                    continue;
                }
                let overdue = match peer.last_seen_us {
                    Some(last_seen) => now_us - last_seen >= timeout_us,
                    None => true,
                };
                if overdue {
                    let _ = rap::record_miss(&self.store, &peer.callsign, &self.cfg);
                }
            }
            peers
                .into_iter()
                .filter(|p| p.enabled)
                .map(|p| Outbound {
                    to_node_id: p.node_id,
                    text: rap::encode_ping().encode(),
                })
                .collect()
        } else {
            Vec::new()
        }
    }

    fn on_route_share_tick(&mut self) -> Vec<Outbound> {
        let Ok(table) = rap::build_route_table(&self.store, &self.cfg.callsign) else {
            return Vec::new();
        };
        let Ok(peers) = self.store.all_peers() else { return Vec::new() };
        peers
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| Outbound {
                to_node_id: p.node_id,
                text: rap::encode_routes(&table).encode(),
            })
            .collect()
    }

    fn on_delivery_sweep_tick(&mut self, now_us: i64) -> Vec<Outbound> {
        self.mail
            .sweep(&self.cfg, now_us)
            .into_iter()
            .map(|action| match action {
                DeliveryAction::Resend { frame, next_hop_node_id } => Outbound {
                    to_node_id: next_hop_node_id,
                    text: frame.encode(),
                },
                DeliveryAction::Expired { from_node_id, to_user, to_bbs, .. } => {
                    warn!(to_user, to_bbs, "mail delivery expired before completion");
                    Outbound {
                        to_node_id: from_node_id,
                        text: error::BbsError::DeliveryExpired.user_message(),
                    }
                }
            })
            .collect()
    }

    fn on_board_sync_tick(&mut self, now_us: i64) -> Vec<Outbound> {
        let Ok(boards) = self.store.synced_boards() else { return Vec::new() };
        let Ok(peers) = self.store.all_peers() else { return Vec::new() };
        let mut out = Vec::new();
        for b in boards {
            if !board::BoardSyncEngine::should_sync(b.pending_count, b.last_sync_at_us, now_us, &self.cfg) {
                continue;
            }
            for peer in peers.iter().filter(|p| p.enabled) {
                self.boards.begin_outgoing(&peer.callsign, &b.name, b.last_sync_at_us);
                out.push(Outbound {
                    to_node_id: peer.node_id.clone(),
                    text: board::encode_boardreq(&b.name, b.pending_count, b.last_sync_at_us).encode(),
                });
            }
        }
        out
    }

    fn insert_synced_post(&self, board_name: &str, post: &board::PostRecord, board_key: &meshbbs_core::crypto::Key, now_us: i64) {
        use meshbbs_core::crypto;
        use meshbbs_core::store::{MessageKind, NewMessage};
        use uuid::Uuid;

        let Ok(uuid) = Uuid::parse_str(&post.uuid) else { return };
        if self.store.message_exists(&uuid).unwrap_or(true) {
            return;
        }
        let ciphertext = crypto::encrypt(board_key, &uuid, now_us, post.body.as_bytes());
        let _ = self.store.insert_message(&NewMessage {
            uuid,
            kind: MessageKind::Bulletin,
            sender_user_id: None,
            recipient_user_id: None,
            board_name: Some(board_name.to_string()),
            author: Some(post.federated_author()),
            origin_bbs: post.origin_bbs.clone(),
            subject_ciphertext: None,
            body_ciphertext: ciphertext,
            created_at_us: post.timestamp_us,
            expires_at_us: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbbs_core::config::PeerConfig;
    use meshbbs_core::crypto::random_salt;

    fn instance(callsign: &str) -> BbsInstance {
        let salt = random_salt();
        let store = Store::open_in_memory(salt).unwrap();
        let mut cfg = Config::default();
        cfg.callsign = callsign.to_string();
        BbsInstance::new(cfg, store, "operator passphrase", 0).unwrap()
    }

    #[test]
    fn register_command_creates_session_and_replies() {
        let mut instance = instance("B0");
        let out = instance.handle_inbound("!node1", "!register alice hunter2", 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_node_id, "!node1");
        assert_eq!(out[0].text, "registered. you're logged in.");
    }

    #[test]
    fn rap_ping_from_unconfigured_node_is_dropped() {
        let mut instance = instance("B0");
        let out = instance.handle_inbound("!unknown", "advBBS|1|RAP_PING|0", 0);
        assert!(out.is_empty());
    }

    #[test]
    fn rap_ping_from_configured_peer_replies_pong() {
        let mut instance = instance("B0");
        instance.cfg.peers.push(PeerConfig {
            node_id: "!peer1".to_string(),
            callsign: "B1".to_string(),
            enabled: true,
        });
        instance.store.upsert_peer("!peer1", "B1").unwrap();
        let out = instance.handle_inbound("!peer1", "advBBS|1|RAP_PING|0", 0);
        assert_eq!(out.len(), 1);
        assert!(out[0].text.contains("RAP_PONG"));
    }

    #[test]
    fn pong_carries_sender_timestamp_for_latency() {
        let mut instance = instance("B0");
        instance.cfg.peers.push(PeerConfig {
            node_id: "!peer1".to_string(),
            callsign: "B1".to_string(),
            enabled: true,
        });
        instance.store.upsert_peer("!peer1", "B1").unwrap();
        let out = instance.handle_inbound("!peer1", "advBBS|1|RAP_PING|0", 555_000);
        assert_eq!(out.len(), 1);
        assert!(out[0].text.contains("RAP_PONG|555000|"));
    }

    #[test]
    fn multi_fragment_inbound_is_reassembled_before_routing() {
        let mut instance = instance("B0");
        instance.cfg.peers.push(PeerConfig {
            node_id: "!peer1".to_string(),
            callsign: "B1".to_string(),
            enabled: true,
        });
        instance.store.upsert_peer("!peer1", "B1").unwrap();
        let frame = "advBBS|1|RAP_PING|0";
        let chunks = meshbbs_core::chunker::chunk(frame, 8, 10).unwrap();
        assert!(chunks.len() > 1);

        let mut out = Vec::new();
        for c in &chunks {
            out = instance.handle_inbound("!peer1", c, 0);
        }
        assert_eq!(out.len(), 1);
        assert!(out[0].text.contains("RAP_PONG"));
    }

    #[test]
    fn heartbeat_tick_pings_every_enabled_peer() {
        let mut instance = instance("B0");
        instance.cfg.peers.push(PeerConfig {
            node_id: "!peer1".to_string(),
            callsign: "B1".to_string(),
            enabled: true,
        });
        instance.store.upsert_peer("!peer1", "B1").unwrap();
        let out = instance.on_tick(scheduler::Tick::RapHeartbeat, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_node_id, "!peer1");
        assert!(out[0].text.contains("RAP_PING"));
    }

    #[test]
    fn expire_messages_tick_removes_past_expiry_rows() {
        use meshbbs_core::store::{MessageKind, NewMessage};
        use uuid::Uuid;

        let mut instance = instance("B0");
        let uuid = Uuid::new_v4();
        instance
            .store
            .insert_message(&NewMessage {
                uuid,
                kind: MessageKind::Bulletin,
                sender_user_id: None,
                recipient_user_id: None,
                board_name: Some("general".to_string()),
                author: Some("alice".to_string()),
                origin_bbs: "B0".to_string(),
                subject_ciphertext: None,
                body_ciphertext: vec![0u8; 4],
                created_at_us: 0,
                expires_at_us: Some(100),
            })
            .unwrap();
        assert!(instance.store.message_exists(&uuid).unwrap());
        instance.on_tick(scheduler::Tick::ExpireMessages, 200);
        assert!(!instance.store.message_exists(&uuid).unwrap());
    }

    #[test]
    fn board_sync_initiator_flow_completes_full_round_trip() {
        use meshbbs_core::crypto;
        use meshbbs_core::store::{MessageKind, NewMessage};
        use uuid::Uuid;

        let mut a = instance("B0");
        let mut b = instance("B1");
        a.cfg.batch_threshold = 1;
        a.cfg.peers.push(PeerConfig {
            node_id: "!b".to_string(),
            callsign: "B1".to_string(),
            enabled: true,
        });
        b.cfg.peers.push(PeerConfig {
            node_id: "!a".to_string(),
            callsign: "B0".to_string(),
            enabled: true,
        });
        a.store.upsert_peer("!b", "B1").unwrap();
        b.store.upsert_peer("!a", "B0").unwrap();

        let board = a.store.find_board("general").unwrap().unwrap();
        let key = a.master.unwrap(&board.wrapped_key).unwrap();
        let uuid = Uuid::new_v4();
        let ciphertext = crypto::encrypt(&key, &uuid, 0, b"hello board");
        a.store
            .insert_message(&NewMessage {
                uuid,
                kind: MessageKind::Bulletin,
                sender_user_id: None,
                recipient_user_id: None,
                board_name: Some("general".to_string()),
                author: Some("alice".to_string()),
                origin_bbs: "B0".to_string(),
                subject_ciphertext: None,
                body_ciphertext: ciphertext,
                created_at_us: 0,
                expires_at_us: None,
            })
            .unwrap();
        a.store.increment_pending("general").unwrap();

        let boardreq = a.on_tick(scheduler::Tick::BoardSyncCheck, 1_000);
        assert_eq!(boardreq.len(), 1);
        assert_eq!(boardreq[0].to_node_id, "!b");

        let boardack = b.handle_inbound("!a", &boardreq[0].text, 1_000);
        assert_eq!(boardack.len(), 1);
        assert!(boardack[0].text.contains("BOARDACK"));

        let boarddat = a.handle_inbound("!b", &boardack[0].text, 1_000);
        assert!(!boarddat.is_empty());

        let mut boarddlv = Vec::new();
        for frame in &boarddat {
            boarddlv = b.handle_inbound("!a", &frame.text, 1_000);
        }
        assert_eq!(boarddlv.len(), 1);
        assert!(boarddlv[0].text.contains("BOARDDLV"));

        let posts = b.store.board_posts("general", 10, 0).unwrap();
        assert_eq!(posts.len(), 1);

        let ack_out = a.handle_inbound("!b", &boarddlv[0].text, 1_000);
        assert!(ack_out.is_empty());
        let board = a.store.find_board("general").unwrap().unwrap();
        assert_eq!(board.pending_count, 0);
    }
}
