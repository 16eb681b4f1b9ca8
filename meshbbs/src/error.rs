//! Session-, input-, and transport-level errors, plus conversions from
//! the crates below into the short human string returned to a sender
//! node.

use meshbbs_core::error::CoreError;
use meshbbs_proto::error::ProtoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BbsError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("bad syntax: {0}")]
    BadSyntax(String),
    #[error("forbidden for your access level")]
    ForbiddenByAccessLevel,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("this node is not bound to your account")]
    UserNotBoundToNode,
    #[error("message body too long")]
    RemoteBodyTooLong,
    #[error("account locked, try again later")]
    AccountLocked,

    #[error("chunk send failed")]
    ChunkSendFailed,
    #[error("timed out waiting for acknowledgement")]
    AckTimeout,
    #[error("rate limited, please wait")]
    RateLimited,
    #[error("delivery expired before completion")]
    DeliveryExpired,

    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BbsError {
    /// Render as the short string sent back to the originating node.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnknownCommand => "unknown command".to_string(),
            Self::BadSyntax(detail) => format!("bad syntax: {detail}"),
            Self::ForbiddenByAccessLevel => "you can't do that".to_string(),
            Self::InvalidCredentials => "invalid credentials".to_string(),
            Self::UserNotBoundToNode => "this device isn't linked to your account".to_string(),
            Self::RemoteBodyTooLong => "message too long".to_string(),
            Self::AccountLocked => "account locked, try again later".to_string(),
            Self::ChunkSendFailed => "send failed, try again".to_string(),
            Self::AckTimeout => "no response from destination, will retry".to_string(),
            Self::RateLimited => "too many requests, please wait".to_string(),
            Self::DeliveryExpired => "delivery expired".to_string(),
            Self::Core(_) | Self::Proto(_) | Self::Io(_) => "internal error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BbsError>;
