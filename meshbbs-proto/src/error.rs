//! Protocol-level error taxonomy: failures that become NAK reason codes
//! at a peer boundary, plus frame-parsing failures that never leave the
//! local process.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed frame")]
    MalformedFrame,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("sender is not a configured peer")]
    UnknownPeer,
    #[error("route already contains this bbs")]
    Looped,
    #[error("hop count exceeds max_hops")]
    MaxHopsExceeded,
    #[error("no route to destination bbs")]
    NoRouteToBbs,
    #[error("recipient user is not registered here")]
    RecipientUnknown,
    #[error("board sync is not enabled for this board")]
    SyncDisabledForBoard,
    #[error("board is not known locally")]
    UnknownBoard,
    #[error("message body exceeds the configured maximum")]
    RemoteBodyTooLong,
}

impl ProtoError {
    /// The short reason code carried on the wire in a NAK frame.
    pub fn nak_code(self) -> &'static str {
        match self {
            Self::Looped => "LOOP",
            Self::MaxHopsExceeded => "MAXHOPS",
            Self::NoRouteToBbs => "NOROUTE",
            Self::RecipientUnknown => "NOUSER",
            Self::SyncDisabledForBoard => "SYNC_DISABLED",
            Self::UnknownBoard => "UNKNOWN_BOARD",
            Self::RemoteBodyTooLong => "TOO_LONG",
            Self::MalformedFrame | Self::UnsupportedVersion | Self::UnknownPeer => "MALFORMED",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
