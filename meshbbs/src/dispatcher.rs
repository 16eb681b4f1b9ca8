//! `!`-prefixed command parsing and dispatch.
//!
//! A command's access level gates whether it runs at all; the handler
//! itself only ever sees a session it's already entitled to use. Reply
//! contexts (implicit `!reply`/`!post` after reading mail or entering a
//! board) are owned here since they are dispatch-surface state, not
//! federation or session state.

use std::collections::HashMap;

use meshbbs_core::config::Config;
use meshbbs_core::crypto::{self, MasterKey};
use meshbbs_core::store::{BoardKind, MessageKind, NewBoard, NewMessage, Store};
use meshbbs_proto::error::ProtoError;
use meshbbs_proto::mail::MailEngine;
use meshbbs_proto::rap;
use uuid::Uuid;

use crate::error::{BbsError, Result};
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Always,
    SyncBoardOrAuth,
    Authenticated,
    Admin,
}

const REPLY_CONTEXT_SECS: i64 = 5 * 60;
const POST_CONTEXT_SECS: i64 = 10 * 60;

#[derive(Debug, Clone)]
enum ContextKind {
    Reply { from_addr: String },
    Post { board: String },
}

#[derive(Debug, Clone)]
struct ReplyContext {
    kind: ContextKind,
    expires_us: i64,
}

/// Everything a command handler needs, borrowed for the duration of one
/// dispatch call.
pub struct Deps<'a> {
    pub store: &'a Store,
    pub master: &'a MasterKey,
    pub cfg: &'a Config,
    pub sessions: &'a mut SessionManager,
    pub mail: &'a mut MailEngine,
    pub my_callsign: &'a str,
}

/// A dispatch result: a reply to render back to the sending node, plus
/// any frames that must additionally go out over the federation link
/// (e.g. a `MAILREQ` triggered by `!send`).
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub reply: Option<String>,
    pub outbound: Vec<(String, String)>,
}

impl DispatchOutcome {
    fn text(s: impl Into<String>) -> Self {
        Self {
            reply: Some(s.into()),
            outbound: Vec::new(),
        }
    }
}

/// Access level required for a (lowercased) command token. Commands not
/// listed here default to `Always` and are rejected later as unknown.
fn access_level_for(cmd: &str) -> AccessLevel {
    match cmd {
        "help" | "register" | "login" => AccessLevel::Always,
        "boards" => AccessLevel::SyncBoardOrAuth,
        "logout" | "passwd" | "nodes" | "addnode" | "removenode" | "send" | "read" | "post" => AccessLevel::Authenticated,
        "recover" => AccessLevel::Admin,
        _ => AccessLevel::Always,
    }
}

#[derive(Default)]
pub struct Dispatcher {
    contexts: HashMap<(String, String), ReplyContext>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn context_key(username: &str, node_id: &str) -> (String, String) {
        (username.to_lowercase(), node_id.to_string())
    }

    fn set_reply_context(&mut self, username: &str, node_id: &str, from_addr: String, now_us: i64) {
        self.contexts.insert(
            Self::context_key(username, node_id),
            ReplyContext {
                kind: ContextKind::Reply { from_addr },
                expires_us: now_us + REPLY_CONTEXT_SECS * 1_000_000,
            },
        );
    }

    fn set_post_context(&mut self, username: &str, node_id: &str, board: String, now_us: i64) {
        self.contexts.insert(
            Self::context_key(username, node_id),
            ReplyContext {
                kind: ContextKind::Post { board },
                expires_us: now_us + POST_CONTEXT_SECS * 1_000_000,
            },
        );
    }

    fn clear_context(&mut self, username: &str, node_id: &str) {
        self.contexts.remove(&Self::context_key(username, node_id));
    }

    fn active_context(&self, username: &str, node_id: &str, now_us: i64) -> Option<ContextKind> {
        let entry = self.contexts.get(&Self::context_key(username, node_id))?;
        if now_us > entry.expires_us {
            None
        } else {
            Some(entry.kind.clone())
        }
    }

    /// Handle one line of inbound text from `sender_node`. Plain text
    /// without a leading `!` is interpreted via the active reply/post
    /// context, if any and unexpired; otherwise it is ignored (`None`
    /// reply).
    pub fn dispatch(&mut self, deps: &mut Deps, sender_node: &str, raw_text: &str, now_us: i64) -> DispatchOutcome {
        let trimmed = raw_text.trim();
        let Some(rest) = trimmed.strip_prefix('!') else {
            return self.dispatch_plaintext(deps, sender_node, trimmed, now_us);
        };

        let mut tokens = rest.split_whitespace();
        let Some(cmd) = tokens.next() else {
            return DispatchOutcome::text(BbsError::UnknownCommand.user_message());
        };
        let cmd = cmd.to_lowercase();
        let args: Vec<&str> = tokens.collect();

        // Any explicit command invalidates a pending implicit context.
        if let Some((username, _)) = self.session_owner(deps, sender_node, now_us) {
            self.clear_context(&username, sender_node);
        }

        let level = access_level_for(&cmd);
        if level == AccessLevel::Authenticated && self.require_auth(deps, sender_node, now_us).is_err() {
            return DispatchOutcome::text(BbsError::ForbiddenByAccessLevel.user_message());
        }
        if level == AccessLevel::Admin && !self.is_admin(deps, sender_node, now_us) {
            return DispatchOutcome::text(BbsError::ForbiddenByAccessLevel.user_message());
        }

        match cmd.as_str() {
            "help" => DispatchOutcome::text("commands: !register !login !logout !passwd !nodes !addnode !removenode !send !read !post !boards"),
            "register" => self.cmd_register(deps, sender_node, &args, now_us),
            "login" => self.cmd_login(deps, sender_node, &args, now_us),
            "logout" => self.cmd_logout(deps, sender_node),
            "passwd" => self.cmd_passwd(deps, sender_node, &args, now_us),
            "nodes" => self.cmd_nodes(deps, sender_node, now_us),
            "addnode" => self.cmd_addnode(deps, sender_node, &args, now_us),
            "removenode" => self.cmd_removenode(deps, sender_node, &args, now_us),
            "send" => self.cmd_send(deps, sender_node, &args, now_us),
            "read" => self.cmd_read(deps, sender_node, now_us),
            "post" => self.cmd_post(deps, sender_node, &args, now_us),
            "boards" => self.cmd_boards(deps, sender_node),
            "recover" => self.cmd_recover(deps, &args, now_us),
            _ => DispatchOutcome::text(BbsError::UnknownCommand.user_message()),
        }
    }

    fn is_admin(&self, deps: &Deps, sender_node: &str, now_us: i64) -> bool {
        let Ok((user_id, username)) = self.require_auth(deps, sender_node, now_us) else {
            return false;
        };
        let _ = user_id;
        matches!(deps.store.find_user_by_name(&username), Ok(Some(u)) if u.is_admin)
    }

    fn cmd_recover(&mut self, deps: &mut Deps, args: &[&str], _now_us: i64) -> DispatchOutcome {
        let [target] = args else {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !recover <username>".to_string()).user_message());
        };
        match deps.sessions.admin_recover(deps.store, deps.master, deps.cfg, target) {
            Ok(temp_passphrase) => DispatchOutcome::text(format!("temporary passphrase for {target}: {temp_passphrase}")),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn dispatch_plaintext(&mut self, deps: &mut Deps, sender_node: &str, text: &str, now_us: i64) -> DispatchOutcome {
        let Some((username, _)) = self.session_owner(deps, sender_node, now_us) else {
            return DispatchOutcome::default();
        };
        match self.active_context(&username, sender_node, now_us) {
            Some(ContextKind::Reply { from_addr }) => {
                let args = vec![from_addr.as_str(), text];
                self.cmd_send(deps, sender_node, &args, now_us)
            }
            Some(ContextKind::Post { board }) => {
                let args: Vec<&str> = std::iter::once(board.as_str()).chain(text.split_whitespace()).collect();
                self.cmd_post(deps, sender_node, &args, now_us)
            }
            None => DispatchOutcome::default(),
        }
    }

    fn session_owner(&self, deps: &Deps, node_id: &str, _now_us: i64) -> Option<(String, i64)> {
        // We don't know the username up front (sessions are keyed by
        // (user, node)); scan the in-memory session table for a match on
        // this node. Cheap: session counts are small relative to a mesh's
        // radio-speed traffic.
        deps.sessions.sessions_for_node(node_id)
    }

    fn require_auth(&self, deps: &Deps, sender_node: &str, now_us: i64) -> Result<(i64, String)> {
        let (username, _) = self.session_owner(deps, sender_node, now_us).ok_or(BbsError::InvalidCredentials)?;
        let session = deps
            .sessions
            .active_session(deps.cfg, &username, sender_node, now_us)
            .ok_or(BbsError::InvalidCredentials)?;
        Ok((session.user_id, session.username.clone()))
    }

    fn cmd_register(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        let [name, password] = args else {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !register <name> <password>".to_string()).user_message());
        };
        match deps.sessions.register(deps.store, deps.master, deps.cfg, name, password, sender_node, now_us) {
            Ok(_) => DispatchOutcome::text("registered. you're logged in."),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn cmd_login(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        let [name, password] = args else {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !login <name> <password>".to_string()).user_message());
        };
        match deps.sessions.login(deps.store, deps.cfg, name, password, sender_node, now_us) {
            Ok(_) => DispatchOutcome::text("logged in."),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn cmd_logout(&mut self, deps: &mut Deps, sender_node: &str) -> DispatchOutcome {
        if let Some((username, _)) = self.session_owner(deps, sender_node, i64::MAX) {
            deps.sessions.logout(&username, sender_node);
            self.clear_context(&username, sender_node);
        }
        DispatchOutcome::text("logged out.")
    }

    fn cmd_passwd(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        let [old, new] = args else {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !passwd <old> <new>".to_string()).user_message());
        };
        let (user_id, _) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        match deps.sessions.change_password(deps.store, deps.master, deps.cfg, user_id, old, new) {
            Ok(()) => DispatchOutcome::text("password changed."),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn cmd_nodes(&mut self, deps: &mut Deps, sender_node: &str, now_us: i64) -> DispatchOutcome {
        let (user_id, _) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        match deps.sessions.list_nodes(deps.store, user_id) {
            Ok(nodes) => DispatchOutcome::text(nodes.join(", ")),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn cmd_addnode(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        let [node_id] = args else {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !addnode <node_id>".to_string()).user_message());
        };
        let (user_id, _) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        match deps.sessions.add_node(deps.store, user_id, node_id, now_us) {
            Ok(()) => DispatchOutcome::text("node added."),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn cmd_removenode(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        let [node_id] = args else {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !removenode <node_id>".to_string()).user_message());
        };
        let (user_id, _) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        match deps.sessions.remove_node(deps.store, user_id, node_id, sender_node) {
            Ok(()) => DispatchOutcome::text("node removed."),
            Err(e) => DispatchOutcome::text(e.user_message()),
        }
    }

    fn cmd_send(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        if args.len() < 2 {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !send <user>@<bbs> <text>".to_string()).user_message());
        }
        let (_, username) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        let addr = args[0];
        let body = args[1..].join(" ");
        let Some((to_user, to_bbs)) = addr.split_once('@') else {
            return DispatchOutcome::text(BbsError::BadSyntax("address must be user@bbs".to_string()).user_message());
        };

        let next_hop = if to_bbs.eq_ignore_ascii_case(deps.my_callsign) {
            None
        } else {
            match rap::lookup_next_hop(deps.store, to_bbs) {
                Ok(Some(hop)) => Some(hop),
                Ok(None) => return DispatchOutcome::text("no route to that bbs"),
                Err(e) => return DispatchOutcome::text(BbsError::from(e).user_message()),
            }
        };

        let Some(next_hop_node_id) = next_hop else {
            return DispatchOutcome::text("local delivery isn't handled by !send; use a local compose path");
        };

        let uuid = Uuid::new_v4().to_string();
        match deps.mail.compose(
            deps.cfg,
            uuid,
            sender_node,
            &username,
            deps.my_callsign,
            to_user,
            to_bbs,
            next_hop_node_id.clone(),
            &body,
            now_us,
        ) {
            Ok(frame) => DispatchOutcome {
                reply: Some("message queued.".to_string()),
                outbound: vec![(next_hop_node_id, frame.encode())],
            },
            Err(ProtoError::RemoteBodyTooLong) => DispatchOutcome::text(BbsError::RemoteBodyTooLong.user_message()),
            Err(e) => DispatchOutcome::text(BbsError::from(e).user_message()),
        }
    }

    fn cmd_read(&mut self, deps: &mut Deps, sender_node: &str, now_us: i64) -> DispatchOutcome {
        let (user_id, username) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        let unread = match deps.store.unread_mail_for_user(user_id) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(BbsError::from(e).user_message()),
        };
        let Some(msg) = unread.into_iter().next() else {
            return DispatchOutcome::text("no unread mail.");
        };
        let user = match deps.store.find_user_by_name(&username) {
            Ok(Some(u)) => u,
            Ok(None) => return DispatchOutcome::text(BbsError::InvalidCredentials.user_message()),
            Err(e) => return DispatchOutcome::text(BbsError::from(e).user_message()),
        };
        let key = match deps.master.unwrap(&user.wrapped_key) {
            Ok(k) => k,
            Err(e) => return DispatchOutcome::text(BbsError::from(e).user_message()),
        };
        let body = match crypto::decrypt(&key, &msg.uuid, msg.created_at_us, &msg.body_ciphertext) {
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(e) => return DispatchOutcome::text(BbsError::from(e).user_message()),
        };
        let _ = deps.store.mark_read(&msg.uuid, now_us);
        let from_addr = format!("{}@{}", msg.author.clone().unwrap_or_default(), msg.origin_bbs);
        self.set_reply_context(&username, sender_node, from_addr, now_us);
        DispatchOutcome::text(format!("from {}@{}: {}", msg.author.unwrap_or_default(), msg.origin_bbs, body))
    }

    fn cmd_post(&mut self, deps: &mut Deps, sender_node: &str, args: &[&str], now_us: i64) -> DispatchOutcome {
        if args.len() < 2 {
            return DispatchOutcome::text(BbsError::BadSyntax("usage: !post <board> <text>".to_string()).user_message());
        }
        let (_, username) = match self.require_auth(deps, sender_node, now_us) {
            Ok(v) => v,
            Err(e) => return DispatchOutcome::text(e.user_message()),
        };
        let board_name = args[0];
        let body = args[1..].join(" ");
        let Ok(Some(board)) = deps.store.find_board(board_name) else {
            return DispatchOutcome::text("unknown board.");
        };
        let board_key = match deps.master.unwrap(&board.wrapped_key) {
            Ok(k) => k,
            Err(e) => return DispatchOutcome::text(BbsError::from(e).user_message()),
        };
        let uuid = Uuid::new_v4();
        let ciphertext = crypto::encrypt(&board_key, &uuid, now_us, body.as_bytes());
        let msg = NewMessage {
            uuid,
            kind: MessageKind::Bulletin,
            sender_user_id: None,
            recipient_user_id: None,
            board_name: Some(board_name.to_string()),
            author: Some(username.clone()),
            origin_bbs: deps.my_callsign.to_string(),
            subject_ciphertext: None,
            body_ciphertext: ciphertext,
            created_at_us: now_us,
            expires_at_us: None,
        };
        if let Err(e) = deps.store.insert_message(&msg) {
            return DispatchOutcome::text(BbsError::from(e).user_message());
        }
        let _ = deps.store.increment_pending(board_name);
        self.set_post_context(&username, sender_node, board_name.to_string(), now_us);
        DispatchOutcome::text(format!("posted to {board_name}."))
    }

    fn cmd_boards(&mut self, deps: &mut Deps, _sender_node: &str) -> DispatchOutcome {
        match deps.store.find_board("general") {
            Ok(Some(_)) => DispatchOutcome::text("general"),
            Ok(None) => DispatchOutcome::text("no boards configured."),
            Err(e) => DispatchOutcome::text(BbsError::from(e).user_message()),
        }
    }
}

/// Creates the default `general` (synced) and `local` (unsynced) boards if
/// they don't already exist.
pub fn ensure_default_boards(store: &Store, master: &MasterKey, now_us: i64) -> Result<()> {
    if store.find_board("general")?.is_none() {
        let key = meshbbs_core::crypto::Key::random();
        store.create_board(&NewBoard {
            name: "general".to_string(),
            description: "default public board".to_string(),
            created_at_us: now_us,
            synced: true,
            kind: BoardKind::Public,
            wrapped_key: master.wrap(&key),
        })?;
    }
    if store.find_board("local")?.is_none() {
        let key = meshbbs_core::crypto::Key::random();
        store.create_board(&NewBoard {
            name: "local".to_string(),
            description: "local-only board".to_string(),
            created_at_us: now_us,
            synced: false,
            kind: BoardKind::Public,
            wrapped_key: master.wrap(&key),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbbs_core::crypto::random_salt;

    fn fixture() -> (Store, MasterKey, Config) {
        let salt = random_salt();
        let store = Store::open_in_memory(salt).unwrap();
        let cfg = Config::default();
        let master = MasterKey::derive("operator passphrase", &salt, &cfg.kdf).unwrap();
        ensure_default_boards(&store, &master, 0).unwrap();
        (store, master, cfg)
    }

    #[test]
    fn unknown_command_returns_standard_message() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        let mut mail = MailEngine::new();
        let mut dispatcher = Dispatcher::new();
        let mut deps = Deps {
            store: &store,
            master: &master,
            cfg: &cfg,
            sessions: &mut sessions,
            mail: &mut mail,
            my_callsign: "B0",
        };
        let outcome = dispatcher.dispatch(&mut deps, "!node1", "!frobnicate", 0);
        assert_eq!(outcome.reply.as_deref(), Some("unknown command"));
    }

    #[test]
    fn send_requires_authentication() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        let mut mail = MailEngine::new();
        let mut dispatcher = Dispatcher::new();
        let mut deps = Deps {
            store: &store,
            master: &master,
            cfg: &cfg,
            sessions: &mut sessions,
            mail: &mut mail,
            my_callsign: "B0",
        };
        let outcome = dispatcher.dispatch(&mut deps, "!node1", "!send u1@B0 hi", 0);
        assert_eq!(outcome.reply.as_deref(), Some("you can't do that"));
    }

    #[test]
    fn register_then_post_to_board() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        let mut mail = MailEngine::new();
        let mut dispatcher = Dispatcher::new();
        let mut deps = Deps {
            store: &store,
            master: &master,
            cfg: &cfg,
            sessions: &mut sessions,
            mail: &mut mail,
            my_callsign: "B0",
        };
        dispatcher.dispatch(&mut deps, "!node1", "!register alice hunter2", 0);
        let outcome = dispatcher.dispatch(&mut deps, "!node1", "!post general hello mesh", 0);
        assert_eq!(outcome.reply.as_deref(), Some("posted to general."));
    }

    #[test]
    fn send_with_oversized_body_reports_too_long_not_internal_error() {
        let (store, master, cfg) = fixture();
        store
            .upsert_route(&meshbbs_core::store::RouteEntry {
                destination_callsign: "B4".to_string(),
                next_hop_node_id: "!hop".to_string(),
                hop_count: 1,
                quality: 1.0,
                learned_at_us: 0,
                expires_at_us: 1_000_000_000,
            })
            .unwrap();
        let mut sessions = SessionManager::new();
        let mut mail = MailEngine::new();
        let mut dispatcher = Dispatcher::new();
        let mut deps = Deps {
            store: &store,
            master: &master,
            cfg: &cfg,
            sessions: &mut sessions,
            mail: &mut mail,
            my_callsign: "B0",
        };
        dispatcher.dispatch(&mut deps, "!node1", "!register alice hunter2", 0);
        let body = "x".repeat(cfg.remote_body_max + 1);
        let outcome = dispatcher.dispatch(&mut deps, "!node1", &format!("!send bob@B4 {body}"), 0);
        assert_eq!(outcome.reply.as_deref(), Some("message too long"));
    }

    #[test]
    fn implicit_post_context_after_posting() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        let mut mail = MailEngine::new();
        let mut dispatcher = Dispatcher::new();
        let mut deps = Deps {
            store: &store,
            master: &master,
            cfg: &cfg,
            sessions: &mut sessions,
            mail: &mut mail,
            my_callsign: "B0",
        };
        dispatcher.dispatch(&mut deps, "!node1", "!register alice hunter2", 0);
        dispatcher.dispatch(&mut deps, "!node1", "!post general first", 0);
        let outcome = dispatcher.dispatch(&mut deps, "!node1", "second post via context", 0);
        assert_eq!(outcome.reply.as_deref(), Some("posted to general."));
    }
}
