//! Persistent, single-writer store.
//!
//! Backed by a bundled SQLite file. One [`Store`] owns the write
//! connection; reads go through the same connection since `rusqlite`
//! serializes per-connection access anyway and the spec only requires a
//! single writer, not a separate reader pool. Migrations are forward-only
//! and tracked via `PRAGMA user_version`; migration 0 creates the
//! immutable `bbs_settings.master_key_salt` row.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{CoreError, Result};

const MIGRATIONS: &[&str] = &[
    // migration 0: settings, users, nodes, bindings
    r#"
    CREATE TABLE bbs_settings (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        master_key_salt BLOB NOT NULL
    );
    CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        password_hash BLOB NOT NULL,
        password_salt BLOB NOT NULL,
        wrapped_key BLOB NOT NULL,
        wrapped_key_admin BLOB,
        created_at_us INTEGER NOT NULL,
        last_seen_us INTEGER NOT NULL,
        is_admin INTEGER NOT NULL DEFAULT 0,
        banned INTEGER NOT NULL DEFAULT 0,
        ban_reason TEXT,
        ban_origin TEXT,
        ban_actor TEXT,
        ban_at_us INTEGER
    );
    CREATE TABLE nodes (
        node_id TEXT PRIMARY KEY,
        display_name TEXT,
        first_seen_us INTEGER NOT NULL,
        last_seen_us INTEGER NOT NULL,
        last_rssi REAL,
        last_snr REAL
    );
    CREATE TABLE user_node_bindings (
        user_id INTEGER NOT NULL REFERENCES users(id),
        node_id TEXT NOT NULL REFERENCES nodes(node_id),
        is_primary INTEGER NOT NULL DEFAULT 0,
        bound_at_us INTEGER NOT NULL,
        PRIMARY KEY (user_id, node_id)
    );
    "#,
    // migration 1: boards, messages
    r#"
    CREATE TABLE boards (
        name TEXT PRIMARY KEY COLLATE NOCASE,
        description TEXT NOT NULL DEFAULT '',
        created_at_us INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        kind TEXT NOT NULL DEFAULT 'public',
        wrapped_key BLOB NOT NULL,
        pending_count INTEGER NOT NULL DEFAULT 0,
        last_sync_at_us INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE board_access (
        board_name TEXT NOT NULL REFERENCES boards(name),
        user_id INTEGER NOT NULL REFERENCES users(id),
        wrapped_key BLOB NOT NULL,
        PRIMARY KEY (board_name, user_id)
    );
    CREATE TABLE messages (
        uuid TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        sender_user_id INTEGER REFERENCES users(id),
        recipient_user_id INTEGER REFERENCES users(id),
        board_name TEXT REFERENCES boards(name),
        author TEXT,
        origin_bbs TEXT NOT NULL,
        subject_ciphertext BLOB,
        body_ciphertext BLOB NOT NULL,
        created_at_us INTEGER NOT NULL,
        delivered_at_us INTEGER,
        read_at_us INTEGER,
        expires_at_us INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_us INTEGER,
        forwarded_to TEXT,
        hop_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_messages_recipient ON messages(recipient_user_id, created_at_us);
    CREATE INDEX idx_messages_board ON messages(board_name, created_at_us);
    "#,
    // migration 2: peers, routes, sync log
    r#"
    CREATE TABLE peers (
        node_id TEXT PRIMARY KEY,
        callsign TEXT NOT NULL UNIQUE COLLATE NOCASE,
        enabled INTEGER NOT NULL DEFAULT 1,
        health TEXT NOT NULL DEFAULT 'unknown',
        miss_count INTEGER NOT NULL DEFAULT 0,
        last_seen_us INTEGER,
        last_sync_us INTEGER,
        quality REAL NOT NULL DEFAULT 1.0
    );
    CREATE TABLE routes (
        destination_callsign TEXT PRIMARY KEY COLLATE NOCASE,
        next_hop_node_id TEXT NOT NULL,
        hop_count INTEGER NOT NULL,
        quality REAL NOT NULL,
        learned_at_us INTEGER NOT NULL,
        expires_at_us INTEGER NOT NULL
    );
    CREATE TABLE sync_log (
        message_uuid TEXT NOT NULL,
        peer_callsign TEXT NOT NULL COLLATE NOCASE,
        direction TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_us INTEGER,
        PRIMARY KEY (message_uuid, peer_callsign, direction)
    );
    "#,
];

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at `path` and apply any pending
    /// migrations. `salt_if_new` supplies the master-key salt used the
    /// first time the store is created; ignored on subsequent opens.
    pub fn open(path: impl AsRef<std::path::Path>, salt_if_new: [u8; 16]) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.migrate(salt_if_new)?;
        Ok(store)
    }

    pub fn open_in_memory(salt_if_new: [u8; 16]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.migrate(salt_if_new)?;
        Ok(store)
    }

    fn migrate(&mut self, salt_if_new: [u8; 16]) -> Result<()> {
        let current: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))?;
        let current = current as usize;
        let tx = self.conn.transaction()?;
        for (i, migration) in MIGRATIONS.iter().enumerate().skip(current) {
            tx.execute_batch(migration)?;
            if i == 0 {
                tx.execute(
                    "INSERT INTO bbs_settings (id, master_key_salt) VALUES (0, ?1)",
                    params![salt_if_new.to_vec()],
                )?;
            }
        }
        tx.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch the immutable master-key salt. Returns [`CoreError::CorruptStore`]
    /// if it is missing while user rows exist — this must never be treated
    /// as "generate a new one".
    pub fn master_key_salt(&self) -> Result<[u8; 16]> {
        let row: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT master_key_salt FROM bbs_settings WHERE id = 0", [], |r| r.get(0))
            .optional()?;
        match row {
            Some(bytes) => bytes.try_into().map_err(|_| CoreError::CorruptStore),
            None => Err(CoreError::CorruptStore),
        }
    }

    // --- Users ---------------------------------------------------------

    pub fn create_user(&self, user: &NewUser) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO users (name, password_hash, password_salt, wrapped_key, wrapped_key_admin, created_at_us, last_seen_us, is_admin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
            params![
                user.name,
                user.password_hash,
                user.password_salt,
                user.wrapped_key,
                user.wrapped_key_admin,
                user.created_at_us,
                user.is_admin as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_user_by_name(&self, name: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, name, password_hash, password_salt, wrapped_key, wrapped_key_admin,
                        created_at_us, last_seen_us, is_admin, banned
                 FROM users WHERE name = ?1 COLLATE NOCASE",
                params![name],
                User::from_row,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn touch_user_seen(&self, user_id: i64, now_us: i64) -> Result<()> {
        self.conn
            .execute("UPDATE users SET last_seen_us = ?1 WHERE id = ?2", params![now_us, user_id])?;
        Ok(())
    }

    pub fn set_user_password(&self, user_id: i64, password_hash: &[u8], password_salt: &[u8], wrapped_key: &[u8]) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET password_hash = ?1, password_salt = ?2, wrapped_key = ?3 WHERE id = ?4",
            params![password_hash, password_salt, wrapped_key, user_id],
        )?;
        Ok(())
    }

    // --- Nodes & bindings ------------------------------------------------

    pub fn upsert_node(&self, node_id: &str, now_us: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO nodes (node_id, first_seen_us, last_seen_us) VALUES (?1, ?2, ?2)
             ON CONFLICT(node_id) DO UPDATE SET last_seen_us = excluded.last_seen_us",
            params![node_id, now_us],
        )?;
        Ok(())
    }

    pub fn bind_node(&self, user_id: i64, node_id: &str, primary: bool, now_us: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO user_node_bindings (user_id, node_id, is_primary, bound_at_us) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, node_id, primary as i64, now_us],
        )?;
        Ok(())
    }

    pub fn binding_count(&self, user_id: i64) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_node_bindings WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn is_bound(&self, user_id: i64, node_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_node_bindings WHERE user_id = ?1 AND node_id = ?2",
            params![user_id, node_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn remove_binding(&self, user_id: i64, node_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM user_node_bindings WHERE user_id = ?1 AND node_id = ?2",
            params![user_id, node_id],
        )?;
        Ok(())
    }

    pub fn list_nodes_for_user(&self, user_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT node_id FROM user_node_bindings WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |r| r.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    // --- Messages --------------------------------------------------------

    /// Insert a message. Returns `true` if inserted, `false` if the UUID
    /// already existed (a silent no-op dedup, per spec).
    pub fn insert_message(&self, msg: &NewMessage) -> Result<bool> {
        let existing: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages WHERE uuid = ?1", params![msg.uuid.to_string()], |r| r.get(0))?;
        if existing > 0 {
            return Ok(false);
        }
        self.conn.execute(
            "INSERT INTO messages (uuid, kind, sender_user_id, recipient_user_id, board_name, author, origin_bbs,
                subject_ciphertext, body_ciphertext, created_at_us, expires_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                msg.uuid.to_string(),
                msg.kind.as_str(),
                msg.sender_user_id,
                msg.recipient_user_id,
                msg.board_name,
                msg.author,
                msg.origin_bbs,
                msg.subject_ciphertext,
                msg.body_ciphertext,
                msg.created_at_us,
                msg.expires_at_us,
            ],
        )?;
        Ok(true)
    }

    pub fn message_exists(&self, uuid: &Uuid) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages WHERE uuid = ?1", params![uuid.to_string()], |r| r.get(0))?;
        Ok(count > 0)
    }

    pub fn unread_mail_for_user(&self, user_id: i64) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, kind, sender_user_id, recipient_user_id, board_name, author, origin_bbs,
                    subject_ciphertext, body_ciphertext, created_at_us
             FROM messages WHERE recipient_user_id = ?1 AND read_at_us IS NULL ORDER BY created_at_us ASC",
        )?;
        let rows = stmt.query_map(params![user_id], StoredMessage::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn board_posts(&self, board: &str, limit: u32, since_us: i64) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, kind, sender_user_id, recipient_user_id, board_name, author, origin_bbs,
                    subject_ciphertext, body_ciphertext, created_at_us
             FROM messages WHERE board_name = ?1 AND created_at_us >= ?2 ORDER BY created_at_us ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![board, since_us, limit], StoredMessage::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn mark_read(&self, uuid: &Uuid, now_us: i64) -> Result<()> {
        self.conn
            .execute("UPDATE messages SET read_at_us = ?1 WHERE uuid = ?2", params![now_us, uuid.to_string()])?;
        Ok(())
    }

    /// Delete messages past their `expires_at_us`. Returns the row count removed.
    pub fn expire_messages(&self, now_us: i64) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM messages WHERE expires_at_us IS NOT NULL AND expires_at_us < ?1", params![now_us])?)
    }

    // --- Boards ------------------------------------------------------------

    pub fn create_board(&self, board: &NewBoard) -> Result<()> {
        self.conn.execute(
            "INSERT INTO boards (name, description, created_at_us, synced, kind, wrapped_key) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![board.name, board.description, board.created_at_us, board.synced as i64, board.kind.as_str(), board.wrapped_key],
        )?;
        Ok(())
    }

    pub fn find_board(&self, name: &str) -> Result<Option<Board>> {
        self.conn
            .query_row(
                "SELECT name, description, created_at_us, synced, kind, wrapped_key, pending_count, last_sync_at_us FROM boards WHERE name = ?1 COLLATE NOCASE",
                params![name],
                Board::from_row,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn synced_board_count(&self) -> Result<u32> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM boards WHERE synced = 1", [], |r| r.get(0))?;
        Ok(count as u32)
    }

    /// All boards currently flagged `synced`, in no particular order.
    pub fn synced_boards(&self) -> Result<Vec<Board>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, description, created_at_us, synced, kind, wrapped_key, pending_count, last_sync_at_us FROM boards WHERE synced = 1",
        )?;
        let rows = stmt.query_map([], Board::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn increment_pending(&self, board: &str) -> Result<()> {
        self.conn
            .execute("UPDATE boards SET pending_count = pending_count + 1 WHERE name = ?1", params![board])?;
        Ok(())
    }

    pub fn reset_pending(&self, board: &str, now_us: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE boards SET pending_count = 0, last_sync_at_us = ?2 WHERE name = ?1",
            params![board, now_us],
        )?;
        Ok(())
    }

    // --- Peers & routes ------------------------------------------------------

    pub fn upsert_peer(&self, node_id: &str, callsign: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO peers (node_id, callsign) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET callsign = excluded.callsign",
            params![node_id, callsign],
        )?;
        Ok(())
    }

    pub fn set_peer_health(&self, callsign: &str, health: &str, miss_count: u32, last_seen_us: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE peers SET health = ?1, miss_count = ?2, last_seen_us = COALESCE(?3, last_seen_us) WHERE callsign = ?4 COLLATE NOCASE",
            params![health, miss_count, last_seen_us, callsign],
        )?;
        Ok(())
    }

    pub fn all_peers(&self) -> Result<Vec<StoredPeer>> {
        let mut stmt = self
            .conn
            .prepare("SELECT node_id, callsign, enabled, health, miss_count, quality, last_seen_us FROM peers")?;
        let rows = stmt.query_map([], StoredPeer::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn peers_by_health(&self, health: &str) -> Result<Vec<StoredPeer>> {
        let mut stmt = self
            .conn
            .prepare("SELECT node_id, callsign, enabled, health, miss_count, quality, last_seen_us FROM peers WHERE health = ?1")?;
        let rows = stmt.query_map(params![health], StoredPeer::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn upsert_route(&self, route: &RouteEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO routes (destination_callsign, next_hop_node_id, hop_count, quality, learned_at_us, expires_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(destination_callsign) DO UPDATE SET
                next_hop_node_id = excluded.next_hop_node_id,
                hop_count = excluded.hop_count,
                quality = excluded.quality,
                learned_at_us = excluded.learned_at_us,
                expires_at_us = excluded.expires_at_us",
            params![route.destination_callsign, route.next_hop_node_id, route.hop_count, route.quality, route.learned_at_us, route.expires_at_us],
        )?;
        Ok(())
    }

    pub fn find_route(&self, destination_callsign: &str) -> Result<Option<RouteEntry>> {
        self.conn
            .query_row(
                "SELECT destination_callsign, next_hop_node_id, hop_count, quality, learned_at_us, expires_at_us FROM routes WHERE destination_callsign = ?1 COLLATE NOCASE",
                params![destination_callsign],
                RouteEntry::from_row,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn expire_routes(&self, now_us: i64) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM routes WHERE expires_at_us < ?1", params![now_us])?)
    }

    pub fn all_routes(&self) -> Result<Vec<RouteEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT destination_callsign, next_hop_node_id, hop_count, quality, learned_at_us, expires_at_us FROM routes")?;
        let rows = stmt.query_map([], RouteEntry::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    // --- Sync log ------------------------------------------------------------

    pub fn sync_log_status(&self, message_uuid: &Uuid, peer_callsign: &str, direction: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT status FROM sync_log WHERE message_uuid = ?1 AND peer_callsign = ?2 COLLATE NOCASE AND direction = ?3",
                params![message_uuid.to_string(), peer_callsign, direction],
                |r| r.get(0),
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn record_sync_attempt(&self, message_uuid: &Uuid, peer_callsign: &str, direction: &str, now_us: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_log (message_uuid, peer_callsign, direction, status, attempts, last_attempt_us)
             VALUES (?1, ?2, ?3, 'pending', 1, ?4)
             ON CONFLICT(message_uuid, peer_callsign, direction) DO UPDATE SET
                attempts = attempts + 1, last_attempt_us = excluded.last_attempt_us",
            params![message_uuid.to_string(), peer_callsign, direction, now_us],
        )?;
        Ok(())
    }

    pub fn mark_sync_acked(&self, message_uuid: &Uuid, peer_callsign: &str, direction: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_log SET status = 'acked' WHERE message_uuid = ?1 AND peer_callsign = ?2 COLLATE NOCASE AND direction = ?3",
            params![message_uuid.to_string(), peer_callsign, direction],
        )?;
        Ok(())
    }
}

pub struct NewUser {
    pub name: String,
    pub password_hash: Vec<u8>,
    pub password_salt: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub wrapped_key_admin: Option<Vec<u8>>,
    pub created_at_us: i64,
    pub is_admin: bool,
}

pub struct User {
    pub id: i64,
    pub name: String,
    pub password_hash: Vec<u8>,
    pub password_salt: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub wrapped_key_admin: Option<Vec<u8>>,
    pub created_at_us: i64,
    pub last_seen_us: i64,
    pub is_admin: bool,
    pub banned: bool,
}

impl User {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            password_hash: row.get(2)?,
            password_salt: row.get(3)?,
            wrapped_key: row.get(4)?,
            wrapped_key_admin: row.get(5)?,
            created_at_us: row.get(6)?,
            last_seen_us: row.get(7)?,
            is_admin: row.get::<_, i64>(8)? != 0,
            banned: row.get::<_, i64>(9)? != 0,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Mail,
    Bulletin,
}

impl MessageKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Bulletin => "bulletin",
        }
    }
}

pub struct NewMessage {
    pub uuid: Uuid,
    pub kind: MessageKind,
    pub sender_user_id: Option<i64>,
    pub recipient_user_id: Option<i64>,
    pub board_name: Option<String>,
    pub author: Option<String>,
    pub origin_bbs: String,
    pub subject_ciphertext: Option<Vec<u8>>,
    pub body_ciphertext: Vec<u8>,
    pub created_at_us: i64,
    pub expires_at_us: Option<i64>,
}

pub struct StoredMessage {
    pub uuid: Uuid,
    pub kind: String,
    pub sender_user_id: Option<i64>,
    pub recipient_user_id: Option<i64>,
    pub board_name: Option<String>,
    pub author: Option<String>,
    pub origin_bbs: String,
    pub subject_ciphertext: Option<Vec<u8>>,
    pub body_ciphertext: Vec<u8>,
    pub created_at_us: i64,
}

impl StoredMessage {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let uuid_str: String = row.get(0)?;
        Ok(Self {
            uuid: Uuid::parse_str(&uuid_str).unwrap_or_else(|_| Uuid::nil()),
            kind: row.get(1)?,
            sender_user_id: row.get(2)?,
            recipient_user_id: row.get(3)?,
            board_name: row.get(4)?,
            author: row.get(5)?,
            origin_bbs: row.get(6)?,
            subject_ciphertext: row.get(7)?,
            body_ciphertext: row.get(8)?,
            created_at_us: row.get(9)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardKind {
    Public,
    Restricted,
}

impl BoardKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Restricted => "restricted",
        }
    }
}

pub struct NewBoard {
    pub name: String,
    pub description: String,
    pub created_at_us: i64,
    pub synced: bool,
    pub kind: BoardKind,
    pub wrapped_key: Vec<u8>,
}

pub struct Board {
    pub name: String,
    pub description: String,
    pub created_at_us: i64,
    pub synced: bool,
    pub kind: String,
    pub wrapped_key: Vec<u8>,
    pub pending_count: u32,
    pub last_sync_at_us: i64,
}

impl Board {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            description: row.get(1)?,
            created_at_us: row.get(2)?,
            synced: row.get::<_, i64>(3)? != 0,
            kind: row.get(4)?,
            wrapped_key: row.get(5)?,
            pending_count: row.get::<_, i64>(6)? as u32,
            last_sync_at_us: row.get(7)?,
        })
    }
}

pub struct StoredPeer {
    pub node_id: String,
    pub callsign: String,
    pub enabled: bool,
    pub health: String,
    pub miss_count: u32,
    pub quality: f64,
    pub last_seen_us: Option<i64>,
}

impl StoredPeer {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            callsign: row.get(1)?,
            enabled: row.get::<_, i64>(2)? != 0,
            health: row.get(3)?,
            miss_count: row.get::<_, i64>(4)? as u32,
            quality: row.get(5)?,
            last_seen_us: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination_callsign: String,
    pub next_hop_node_id: String,
    pub hop_count: u32,
    pub quality: f64,
    pub learned_at_us: i64,
    pub expires_at_us: i64,
}

impl RouteEntry {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            destination_callsign: row.get(0)?,
            next_hop_node_id: row.get(1)?,
            hop_count: row.get::<_, i64>(2)? as u32,
            quality: row.get(3)?,
            learned_at_us: row.get(4)?,
            expires_at_us: row.get(5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open_in_memory([7u8; 16]).unwrap()
    }

    #[test]
    fn master_salt_persists_across_migrations() {
        let store = test_store();
        assert_eq!(store.master_key_salt().unwrap(), [7u8; 16]);
    }

    #[test]
    fn duplicate_uuid_insert_is_noop() {
        let store = test_store();
        let uuid = Uuid::new_v4();
        let msg = NewMessage {
            uuid,
            kind: MessageKind::Mail,
            sender_user_id: None,
            recipient_user_id: None,
            board_name: None,
            author: Some("u0".into()),
            origin_bbs: "B0".into(),
            subject_ciphertext: None,
            body_ciphertext: vec![1, 2, 3],
            created_at_us: 0,
            expires_at_us: None,
        };
        assert!(store.insert_message(&msg).unwrap());
        assert!(!store.insert_message(&msg).unwrap());

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM messages WHERE uuid = ?1", params![uuid.to_string()], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn user_registration_and_binding() {
        let store = test_store();
        store.upsert_node("!node1", 0).unwrap();
        let id = store
            .create_user(&NewUser {
                name: "alice".into(),
                password_hash: vec![1],
                password_salt: vec![2],
                wrapped_key: vec![3],
                wrapped_key_admin: None,
                created_at_us: 0,
                is_admin: false,
            })
            .unwrap();
        store.bind_node(id, "!node1", true, 0).unwrap();
        assert_eq!(store.binding_count(id).unwrap(), 1);
        assert!(store.is_bound(id, "!node1").unwrap());
        assert!(store.find_user_by_name("ALICE").unwrap().is_some());
    }

    #[test]
    fn route_expiry_removes_stale_entries() {
        let store = test_store();
        store
            .upsert_route(&RouteEntry {
                destination_callsign: "B4".into(),
                next_hop_node_id: "!node1".into(),
                hop_count: 1,
                quality: 1.0,
                learned_at_us: 0,
                expires_at_us: 100,
            })
            .unwrap();
        assert!(store.find_route("B4").unwrap().is_some());
        store.expire_routes(200).unwrap();
        assert!(store.find_route("B4").unwrap().is_none());
    }
}
