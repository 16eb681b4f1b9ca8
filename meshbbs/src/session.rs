//! Registration, login (password + node 2FA), password change, node
//! binding, and admin recovery.
//!
//! Sessions are keyed by `(user, current_node)`: a registered user
//! logged in from two bound devices holds two independent sessions. Idle
//! timeout and the failed-login lockout counter are both in-memory,
//! cooperative-context-only state, matching how the federation engines
//! keep their own non-persistent tables.

use std::collections::HashMap;
use std::time::Duration;

use meshbbs_core::config::Config;
use meshbbs_core::crypto::{self, Key, MasterKey};
use meshbbs_core::store::{NewUser, Store};
use rand::RngCore;

use crate::error::{BbsError, Result};

#[derive(Debug, Clone)]
pub struct SessionState {
    pub user_id: i64,
    pub username: String,
    pub node_id: String,
    pub last_activity_us: i64,
}

#[derive(Default)]
struct LoginAttempts {
    failed_count: u32,
    locked_until_us: i64,
}

pub struct SessionManager {
    sessions: HashMap<(String, String), SessionState>,
    failed_logins: HashMap<String, LoginAttempts>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            failed_logins: HashMap::new(),
        }
    }

    fn key(username: &str, node_id: &str) -> (String, String) {
        (username.to_lowercase(), node_id.to_string())
    }

    /// Atomically creates the user and its first (primary) binding, then
    /// starts a session for `(username, node_id)` — registering also logs
    /// the caller in, per the dispatcher's `!register` reply.
    pub fn register(&mut self, store: &Store, master: &MasterKey, cfg: &Config, username: &str, password: &str, node_id: &str, now_us: i64) -> Result<i64> {
        if store.find_user_by_name(username)?.is_some() {
            return Err(BbsError::BadSyntax("username already taken".to_string()));
        }
        let password_salt = crypto::random_salt();
        let password_hash = crypto::derive_key(password, &password_salt, &cfg.kdf)?;
        let user_key = Key::random();
        let wrapped_key = master.wrap(&user_key);
        let wrapped_key_admin = master.wrap(&user_key);

        store.upsert_node(node_id, now_us)?;
        let user_id = store.create_user(&NewUser {
            name: username.to_string(),
            password_hash: password_hash.as_bytes().to_vec(),
            password_salt: password_salt.to_vec(),
            wrapped_key,
            wrapped_key_admin: Some(wrapped_key_admin),
            created_at_us: now_us,
            is_admin: false,
        })?;
        store.bind_node(user_id, node_id, true, now_us)?;
        self.sessions.insert(
            Self::key(username, node_id),
            SessionState {
                user_id,
                username: username.to_string(),
                node_id: node_id.to_string(),
                last_activity_us: now_us,
            },
        );
        Ok(user_id)
    }

    /// Verify password and node binding; on success start (or refresh) a
    /// session for `(username, node_id)`.
    pub fn login(&mut self, store: &Store, cfg: &Config, username: &str, password: &str, node_id: &str, now_us: i64) -> Result<SessionState> {
        if let Some(attempts) = self.failed_logins.get(&username.to_lowercase()) {
            if now_us < attempts.locked_until_us {
                return Err(BbsError::AccountLocked);
            }
        }

        let Some(user) = store.find_user_by_name(username)? else {
            self.record_failed_login(cfg, username, now_us);
            return Err(BbsError::InvalidCredentials);
        };
        let salt: [u8; 16] = user.password_salt.clone().try_into().map_err(|_| BbsError::InvalidCredentials)?;
        let computed = crypto::derive_key(password, &salt, &cfg.kdf)?;
        if computed.as_bytes().as_slice() != user.password_hash.as_slice() {
            self.record_failed_login(cfg, username, now_us);
            return Err(BbsError::InvalidCredentials);
        }
        if !store.is_bound(user.id, node_id)? {
            return Err(BbsError::UserNotBoundToNode);
        }

        self.failed_logins.remove(&username.to_lowercase());
        store.touch_user_seen(user.id, now_us)?;
        let state = SessionState {
            user_id: user.id,
            username: user.name,
            node_id: node_id.to_string(),
            last_activity_us: now_us,
        };
        self.sessions.insert(Self::key(username, node_id), state.clone());
        Ok(state)
    }

    fn record_failed_login(&mut self, cfg: &Config, username: &str, now_us: i64) {
        let entry = self.failed_logins.entry(username.to_lowercase()).or_default();
        entry.failed_count += 1;
        if entry.failed_count >= cfg.max_failed_logins {
            entry.locked_until_us = now_us + (cfg.lockout_minutes as i64) * 60_000_000;
        }
    }

    pub fn logout(&mut self, username: &str, node_id: &str) {
        self.sessions.remove(&Self::key(username, node_id));
    }

    /// Active session for `(username, node_id)`, or `None` if absent or
    /// idle beyond `session_idle_timeout_secs`.
    pub fn active_session(&self, cfg: &Config, username: &str, node_id: &str, now_us: i64) -> Option<&SessionState> {
        let state = self.sessions.get(&Self::key(username, node_id))?;
        let idle_timeout_us = (cfg.session_idle_timeout_secs as i64) * 1_000_000;
        if now_us - state.last_activity_us > idle_timeout_us {
            None
        } else {
            Some(state)
        }
    }

    /// Find a tracked session on `node_id`, regardless of idle expiry —
    /// used by the dispatcher to locate "who is this node acting as"
    /// before re-validating with [`Self::active_session`].
    pub fn sessions_for_node(&self, node_id: &str) -> Option<(String, i64)> {
        self.sessions
            .values()
            .find(|s| s.node_id == node_id)
            .map(|s| (s.username.clone(), s.user_id))
    }

    pub fn touch(&mut self, username: &str, node_id: &str, now_us: i64) {
        if let Some(state) = self.sessions.get_mut(&Self::key(username, node_id)) {
            state.last_activity_us = now_us;
        }
    }

    pub fn change_password(&self, store: &Store, master: &MasterKey, cfg: &Config, user_id: i64, old_password: &str, new_password: &str) -> Result<()> {
        let user = store
            .find_user_by_name(&self.username_for(store, user_id)?)?
            .ok_or(BbsError::InvalidCredentials)?;
        let old_salt: [u8; 16] = user.password_salt.clone().try_into().map_err(|_| BbsError::InvalidCredentials)?;
        let computed = crypto::derive_key(old_password, &old_salt, &cfg.kdf)?;
        if computed.as_bytes().as_slice() != user.password_hash.as_slice() {
            return Err(BbsError::InvalidCredentials);
        }
        let user_key = master.unwrap(&user.wrapped_key)?;
        let new_salt = crypto::random_salt();
        let new_hash = crypto::derive_key(new_password, &new_salt, &cfg.kdf)?;
        let rewrapped = master.wrap(&user_key);
        store.set_user_password(user_id, new_hash.as_bytes(), &new_salt, &rewrapped)?;
        Ok(())
    }

    fn username_for(&self, store: &Store, user_id: i64) -> Result<String> {
        for session in self.sessions.values() {
            if session.user_id == user_id {
                return Ok(session.username.clone());
            }
        }
        // fall back: not cached in a live session, caller must know the name.
        let _ = store;
        Err(BbsError::InvalidCredentials)
    }

    pub fn add_node(&self, store: &Store, user_id: i64, node_id: &str, now_us: i64) -> Result<()> {
        store.upsert_node(node_id, now_us)?;
        store.bind_node(user_id, node_id, false, now_us)?;
        Ok(())
    }

    /// Forbidden if `node_id` is the caller's last binding or the node
    /// they are currently acting from.
    pub fn remove_node(&self, store: &Store, user_id: i64, node_id: &str, current_node: &str) -> Result<()> {
        if node_id == current_node {
            return Err(BbsError::BadSyntax("cannot unbind the device you're using".to_string()));
        }
        if store.binding_count(user_id)? <= 1 {
            return Err(BbsError::BadSyntax("cannot remove your last device".to_string()));
        }
        store.remove_binding(user_id, node_id)?;
        Ok(())
    }

    pub fn list_nodes(&self, store: &Store, user_id: i64) -> Result<Vec<String>> {
        Ok(store.list_nodes_for_user(user_id)?)
    }

    /// Generate a random temporary passphrase, rewrap the user's key
    /// using its admin-wrapped copy, and return the new passphrase. The
    /// caller must force a password change on next login.
    pub fn admin_recover(&self, store: &Store, master: &MasterKey, cfg: &Config, username: &str) -> Result<String> {
        let user = store.find_user_by_name(username)?.ok_or(BbsError::InvalidCredentials)?;
        let admin_wrapped = user.wrapped_key_admin.clone().ok_or(BbsError::InvalidCredentials)?;
        let user_key = master.unwrap(&admin_wrapped)?;

        let mut temp = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut temp);
        let temp_passphrase = hex_encode(&temp);

        let new_salt = crypto::random_salt();
        let new_hash = crypto::derive_key(&temp_passphrase, &new_salt, &cfg.kdf)?;
        let rewrapped = master.wrap(&user_key);
        store.set_user_password(user.id, new_hash.as_bytes(), &new_salt, &rewrapped)?;
        Ok(temp_passphrase)
    }

    pub fn idle_timeout(cfg: &Config) -> Duration {
        Duration::from_secs(cfg.session_idle_timeout_secs)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
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
        (store, master, cfg)
    }

    #[test]
    fn register_then_login_requires_matching_node() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        sessions.register(&store, &master, &cfg, "alice", "hunter2", "!node1", 0).unwrap();

        assert!(sessions.login(&store, &cfg, "alice", "hunter2", "!node2", 0).is_err());
        let state = sessions.login(&store, &cfg, "alice", "hunter2", "!node1", 0).unwrap();
        assert_eq!(state.username, "alice");
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        sessions.register(&store, &master, &cfg, "alice", "hunter2", "!node1", 0).unwrap();
        assert!(sessions.login(&store, &cfg, "alice", "wrong", "!node1", 0).is_err());
    }

    #[test]
    fn lockout_after_max_failed_logins() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        sessions.register(&store, &master, &cfg, "alice", "hunter2", "!node1", 0).unwrap();
        for _ in 0..cfg.max_failed_logins {
            let _ = sessions.login(&store, &cfg, "alice", "wrong", "!node1", 0);
        }
        let err = sessions.login(&store, &cfg, "alice", "hunter2", "!node1", 0).unwrap_err();
        assert!(matches!(err, BbsError::AccountLocked));
    }

    #[test]
    fn removing_last_binding_is_forbidden() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        let user_id = sessions.register(&store, &master, &cfg, "alice", "hunter2", "!node1", 0).unwrap();
        assert!(sessions.remove_node(&store, user_id, "!node1", "!node1").is_err());
    }

    #[test]
    fn idle_session_expires() {
        let (store, master, cfg) = fixture();
        let mut sessions = SessionManager::new();
        sessions.register(&store, &master, &cfg, "alice", "hunter2", "!node1", 0).unwrap();
        sessions.login(&store, &cfg, "alice", "hunter2", "!node1", 0).unwrap();
        let far_future = (cfg.session_idle_timeout_secs as i64 + 1) * 1_000_000;
        assert!(sessions.active_session(&cfg, "alice", "!node1", far_future).is_none());
    }
}
