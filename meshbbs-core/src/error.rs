//! Core error types
//!
//! Error taxonomy for crypto and store operations. Protocol- and
//! session-level errors live in their own crates and wrap these.

use thiserror::Error;

/// Errors raised by crypto primitives and the persistent store.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The operator passphrase does not authenticate against the stored
    /// wrapped key material.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// An AEAD ciphertext failed to authenticate. Treated as tampering,
    /// never as a soft retry.
    #[error("authentication tag invalid")]
    AuthTagInvalid,

    /// The store is missing `master_key_salt` while user rows exist.
    /// Fatal: the caller must abort startup rather than regenerate it.
    #[error("store is corrupt: master key salt missing while users exist")]
    CorruptStore,

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// TOML config parse failure.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
