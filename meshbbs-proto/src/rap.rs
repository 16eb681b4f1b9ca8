//! Route Announcement Protocol: a distance-vector router over the
//! federation mesh, with per-peer health tracking.
//!
//! State (route table, peer health) lives in the store so it survives a
//! restart; this module is a set of sans-IO functions that read/mutate
//! the store and return the outbound frames the caller (the scheduler)
//! should transmit. Nothing here touches the transport directly.

use meshbbs_core::config::Config;
use meshbbs_core::error::Result as CoreResult;
use meshbbs_core::store::{RouteEntry, Store};

use crate::wire::Frame;

pub const PING: &str = "RAP_PING";
pub const PONG: &str = "RAP_PONG";
pub const ROUTES: &str = "RAP_ROUTES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Unknown,
    Alive,
    Unreachable,
    Dead,
}

impl PeerHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Alive => "alive",
            Self::Unreachable => "unreachable",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "alive" => Self::Alive,
            "unreachable" => Self::Unreachable,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

/// One outbound frame addressed to a peer's transport node id.
pub struct RapOutbound {
    pub to_node_id: String,
    pub frame: Frame,
}

/// Build this instance's route-table wire field: `callsign:hop:quality;...`,
/// self always included at hop 0, quality 1.0. Peers in `dead` health are
/// excluded, per spec.
pub fn build_route_table(store: &Store, my_callsign: &str) -> CoreResult<String> {
    let mut entries = vec![format!("{my_callsign}:0:1")];
    for route in store.all_routes()? {
        let peer_dead = store
            .peers_by_health("dead")?
            .iter()
            .any(|p| p.node_id == route.next_hop_node_id);
        if !peer_dead {
            entries.push(format!("{}:{}:{}", route.destination_callsign, route.hop_count, route.quality));
        }
    }
    Ok(entries.join(";"))
}

fn parse_route_table(field: &str) -> Vec<(String, u32, f64)> {
    field
        .split(';')
        .filter_map(|triple| {
            let mut parts = triple.splitn(3, ':');
            let dest = parts.next()?.to_string();
            let hop: u32 = parts.next()?.parse().ok()?;
            let quality: f64 = parts.next()?.parse().ok()?;
            Some((dest, hop, quality))
        })
        .collect()
}

/// Install routes advertised by `learned_via_callsign`/`via_node_id`,
/// applying the spec's comparison rule per candidate destination.
pub fn install_routes(
    store: &Store,
    via_node_id: &str,
    my_callsign: &str,
    route_table_field: &str,
    cfg: &Config,
    now_us: i64,
) -> CoreResult<()> {
    let expires_at_us = now_us + (cfg.route_expiry_secs as i64) * 1_000_000;
    for (dest, hop, quality) in parse_route_table(route_table_field) {
        if dest.eq_ignore_ascii_case(my_callsign) {
            continue;
        }
        let candidate_hop = hop + 1;
        if candidate_hop > cfg.max_hops as u32 {
            continue;
        }
        match store.find_route(&dest)? {
            None => install(store, &dest, via_node_id, candidate_hop, quality, now_us, expires_at_us)?,
            Some(existing) => {
                if candidate_hop < existing.hop_count
                    || (candidate_hop == existing.hop_count && quality > existing.quality)
                {
                    install(store, &dest, via_node_id, candidate_hop, quality, now_us, expires_at_us)?;
                } else if existing.next_hop_node_id == via_node_id && existing.hop_count == candidate_hop {
                    install(store, &dest, via_node_id, candidate_hop, existing.quality, existing.learned_at_us, expires_at_us)?;
                }
            }
        }
    }
    Ok(())
}

fn install(store: &Store, dest: &str, via_node_id: &str, hop: u32, quality: f64, learned_at_us: i64, expires_at_us: i64) -> CoreResult<()> {
    store.upsert_route(&RouteEntry {
        destination_callsign: dest.to_string(),
        next_hop_node_id: via_node_id.to_string(),
        hop_count: hop,
        quality,
        learned_at_us,
        expires_at_us,
    })
}

/// Build the outbound `RAP_PING` heartbeat probe this instance sends to a peer.
pub fn encode_ping() -> Frame {
    Frame::new(PING, "0")
}

/// Build the outbound `RAP_ROUTES` advertisement carrying `table` (see
/// [`build_route_table`]).
pub fn encode_routes(table: &str) -> Frame {
    Frame::new(ROUTES, format!("0|{table}"))
}

/// React to an inbound `RAP_PING` from `peer_callsign`: mark it alive and
/// produce the `RAP_PONG` reply carrying our own route table and the
/// current timestamp, so the peer can compute round-trip latency.
pub fn on_ping(store: &Store, peer_node_id: &str, peer_callsign: &str, my_callsign: &str, now_us: i64) -> CoreResult<RapOutbound> {
    store.set_peer_health(peer_callsign, PeerHealth::Alive.as_str(), 0, None)?;
    let table = build_route_table(store, my_callsign)?;
    Ok(RapOutbound {
        to_node_id: peer_node_id.to_string(),
        frame: Frame::new(PONG, format!("{now_us}|{table}")),
    })
}

/// React to an inbound `RAP_PONG` (or any routes payload) from a peer:
/// mark it alive and install the advertised routes.
pub fn on_pong_or_routes(
    store: &Store,
    via_node_id: &str,
    peer_callsign: &str,
    my_callsign: &str,
    route_table_field: &str,
    cfg: &Config,
    now_us: i64,
) -> CoreResult<()> {
    store.set_peer_health(peer_callsign, PeerHealth::Alive.as_str(), 0, Some(now_us))?;
    install_routes(store, via_node_id, my_callsign, route_table_field, cfg, now_us)
}

/// Record a missed heartbeat reply for a peer, applying the health FSM's
/// monotonic-forward-on-failure rule.
pub fn record_miss(store: &Store, peer_callsign: &str, cfg: &Config) -> CoreResult<()> {
    let already_dead = store
        .peers_by_health(PeerHealth::Dead.as_str())?
        .into_iter()
        .find(|p| p.callsign.eq_ignore_ascii_case(peer_callsign));
    if let Some(peer) = already_dead {
        // A dead peer only leaves that state via a fresh PONG (on_ping /
        // on_pong_or_routes), never by simply missing more heartbeats.
        return store.set_peer_health(peer_callsign, PeerHealth::Dead.as_str(), peer.miss_count + 1, None);
    }

    let current = store
        .peers_by_health(PeerHealth::Alive.as_str())?
        .into_iter()
        .chain(store.peers_by_health(PeerHealth::Unreachable.as_str())?)
        .chain(store.peers_by_health(PeerHealth::Unknown.as_str())?)
        .find(|p| p.callsign.eq_ignore_ascii_case(peer_callsign));

    let miss_count = current.as_ref().map(|p| p.miss_count).unwrap_or(0) + 1;
    let next_health = if miss_count >= cfg.dead_threshold {
        PeerHealth::Dead
    } else if miss_count >= cfg.unreachable_threshold {
        PeerHealth::Unreachable
    } else {
        PeerHealth::Unknown
    };
    store.set_peer_health(peer_callsign, next_health.as_str(), miss_count, None)
}

/// Next-hop node id for `callsign`, or `None` if absent, expired (caller
/// must have already run [`meshbbs_core::store::Store::expire_routes`]),
/// or the next-hop peer is dead.
pub fn lookup_next_hop(store: &Store, callsign: &str) -> CoreResult<Option<String>> {
    let Some(route) = store.find_route(callsign)? else {
        return Ok(None);
    };
    let dead = store
        .peers_by_health(PeerHealth::Dead.as_str())?
        .iter()
        .any(|p| p.node_id == route.next_hop_node_id);
    Ok(if dead { None } else { Some(route.next_hop_node_id) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbbs_core::config::Config;

    fn store() -> Store {
        Store::open_in_memory([1u8; 16]).unwrap()
    }

    #[test]
    fn ping_marks_peer_alive_and_replies_pong() {
        let s = store();
        s.upsert_peer("!node1", "B1").unwrap();
        let out = on_ping(&s, "!node1", "B1", "B0", 42).unwrap();
        assert_eq!(out.to_node_id, "!node1");
        assert_eq!(out.frame.frame_type, PONG);
        assert!(out.frame.payload.starts_with("42|"));
        assert!(out.frame.payload.contains("B0:0:1"));
    }

    #[test]
    fn dead_peer_stays_dead_on_further_misses() {
        let s = store();
        let cfg = Config::default();
        s.upsert_peer("!node1", "B1").unwrap();
        s.set_peer_health("B1", "dead", 10, None).unwrap();
        record_miss(&s, "B1", &cfg).unwrap();
        assert_eq!(s.peers_by_health("dead").unwrap().len(), 1);
        assert!(s.peers_by_health("unknown").unwrap().is_empty());
    }

    #[test]
    fn installs_route_with_incremented_hop() {
        let s = store();
        let cfg = Config::default();
        install_routes(&s, "!node1", "B0", "B1:0:1;B2:1:1", &cfg, 0).unwrap();
        let route = s.find_route("B2").unwrap().unwrap();
        assert_eq!(route.hop_count, 2);
        assert_eq!(route.next_hop_node_id, "!node1");
    }

    #[test]
    fn rejects_routes_beyond_max_hops() {
        let s = store();
        let mut cfg = Config::default();
        cfg.max_hops = 2;
        install_routes(&s, "!node1", "B0", "B9:5:1", &cfg, 0).unwrap();
        assert!(s.find_route("B9").unwrap().is_none());
    }

    #[test]
    fn prefers_shorter_hop_count() {
        let s = store();
        let cfg = Config::default();
        s.upsert_route(&RouteEntry {
            destination_callsign: "B2".into(),
            next_hop_node_id: "!slow".into(),
            hop_count: 3,
            quality: 1.0,
            learned_at_us: 0,
            expires_at_us: 1_000_000_000,
        })
        .unwrap();
        install_routes(&s, "!fast", "B0", "B2:0:1", &cfg, 0).unwrap();
        let route = s.find_route("B2").unwrap().unwrap();
        assert_eq!(route.next_hop_node_id, "!fast");
        assert_eq!(route.hop_count, 1);
    }

    #[test]
    fn five_node_linear_convergence() {
        let s = store();
        let cfg = Config::default();
        // B0 only hears from B1 directly advertising its own route table.
        install_routes(&s, "!b1", "B0", "B1:0:1;B2:1:1;B3:2:1;B4:3:1", &cfg, 0).unwrap();
        assert_eq!(lookup_next_hop(&s, "B4").unwrap(), Some("!b1".to_string()));
        let r4 = s.find_route("B4").unwrap().unwrap();
        assert_eq!(r4.hop_count, 4);
    }

    #[test]
    fn health_escalates_monotonically_on_misses() {
        let s = store();
        let cfg = Config::default();
        s.upsert_peer("!node1", "B1").unwrap();
        for _ in 0..cfg.unreachable_threshold {
            record_miss(&s, "B1", &cfg).unwrap();
        }
        assert_eq!(s.peers_by_health("unreachable").unwrap().len(), 1);
        for _ in cfg.unreachable_threshold..cfg.dead_threshold {
            record_miss(&s, "B1", &cfg).unwrap();
        }
        assert_eq!(s.peers_by_health("dead").unwrap().len(), 1);
    }

    #[test]
    fn dead_peer_excluded_from_next_hop() {
        let s = store();
        s.upsert_peer("!node1", "B1").unwrap();
        s.set_peer_health("B1", "dead", 10, None).unwrap();
        s.upsert_route(&RouteEntry {
            destination_callsign: "B1".into(),
            next_hop_node_id: "!node1".into(),
            hop_count: 1,
            quality: 1.0,
            learned_at_us: 0,
            expires_at_us: 1_000_000_000,
        })
        .unwrap();
        assert_eq!(lookup_next_hop(&s, "B1").unwrap(), None);
    }
}
