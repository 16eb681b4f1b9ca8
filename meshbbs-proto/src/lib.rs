//! The federation plane: wire framing, the RAP distance-vector router,
//! the mail delivery FSM, the board sync engine, and the top-level
//! federation demux. Depends on `meshbbs-core` for crypto, the store, the
//! chunker and the rate limiter; knows nothing about sessions or the
//! command surface.

pub mod board;
pub mod error;
pub mod federation;
pub mod mail;
pub mod rap;
pub mod wire;

pub mod prelude {
    pub use crate::error::{ProtoError, Result};
    pub use crate::wire::Frame;
}
