//! Top-level demux of an inbound assembled payload from sender `S`.
//!
//! Federation frames (`RAP_*`, `MAIL*`, `BOARD*`) are only honored from a
//! configured peer; `!`-prefixed command input is accepted from anyone,
//! since that is the user-facing path, not the federation path.

use crate::error::Result;
use crate::wire::Frame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Rap(Frame),
    Mail(Frame),
    Board(Frame),
    Command(String),
    Ignored,
}

/// Dispatch one inbound, already-reassembled payload.
///
/// `is_peer` tells the router whether `sender_node` is a configured,
/// enabled peer. Federation frames from a non-peer are dropped here
/// rather than forwarded — the caller should log a warning.
pub fn route(payload: &str, is_peer: bool) -> Result<Route> {
    if let Some(rest) = payload.strip_prefix('!') {
        return Ok(Route::Command(rest.to_string()));
    }

    let frame = Frame::parse(payload)?;
    if !is_peer {
        return Ok(Route::Ignored);
    }

    if frame.frame_type.starts_with("RAP_") {
        Ok(Route::Rap(frame))
    } else if frame.frame_type.starts_with("MAIL") {
        Ok(Route::Mail(frame))
    } else if frame.frame_type.starts_with("BOARD") {
        Ok(Route::Board(frame))
    } else {
        Ok(Route::Ignored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_allowed_from_anyone() {
        let route = route("!help", false).unwrap();
        assert_eq!(route, Route::Command("help".to_string()));
    }

    #[test]
    fn federation_frames_dropped_from_non_peers() {
        let route = route("advBBS|1|MAILREQ|u1|u0|B0|u4|B4|1|1|B0", false).unwrap();
        assert_eq!(route, Route::Ignored);
    }

    #[test]
    fn federation_frames_dispatched_by_prefix() {
        assert!(matches!(route("advBBS|1|RAP_PING|0", true).unwrap(), Route::Rap(_)));
        assert!(matches!(route("advBBS|1|MAILACK|u1|OK", true).unwrap(), Route::Mail(_)));
        assert!(matches!(route("advBBS|1|BOARDACK|general", true).unwrap(), Route::Board(_)));
    }

    #[test]
    fn unknown_frame_type_ignored() {
        assert_eq!(route("advBBS|1|HELLO|x", true).unwrap(), Route::Ignored);
    }
}
