//! Periodic tick scheduling and the cooperative side of the ACK handoff.
//!
//! The scheduler itself only tracks *when* each periodic job last fired
//! and drains the ack channel; it does not own the store, transport, or
//! engines. `BbsInstance` wires tick firings to their actual logic. That
//! split keeps the ordering/suspension contract testable without a real
//! radio or clock.

use std::collections::HashMap;
use std::time::Duration;

use meshbbs_core::config::Config;

use crate::transport::AckSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tick {
    RapHeartbeat,
    RapRouteShare,
    RouteExpiry,
    ChunkCleanup,
    DeliverySweep,
    BoardSyncCheck,
    Announcement,
    Backup,
    ExpireMessages,
}

struct TickClock {
    last_fired_us: HashMap<Tick, i64>,
}

impl TickClock {
    fn new() -> Self {
        Self { last_fired_us: HashMap::new() }
    }

    /// `interval_us == 0` permanently disables the tick (used for the
    /// announcement broadcast, per spec).
    fn due(&mut self, tick: Tick, interval_us: i64, now_us: i64) -> bool {
        if interval_us <= 0 {
            return false;
        }
        match self.last_fired_us.get(&tick) {
            None => {
                self.last_fired_us.insert(tick, now_us);
                true
            }
            Some(&last) => {
                if now_us - last >= interval_us {
                    self.last_fired_us.insert(tick, now_us);
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Drives every periodic job named in the spec's scheduler component, plus
/// the cooperative drain of transport ack signals pushed from a foreign
/// thread.
pub struct Scheduler {
    clock: TickClock,
    ack_rx: flume::Receiver<AckSignal>,
}

impl Scheduler {
    pub fn new(ack_rx: flume::Receiver<AckSignal>) -> Self {
        Self {
            clock: TickClock::new(),
            ack_rx,
        }
    }

    /// Non-blocking drain of every ack signal queued since the last call.
    /// Never awaits — the whole point is that this cooperative task pulls
    /// from the channel on its own schedule, rather than the radio
    /// callback thread blocking until someone reads it.
    pub fn drain_acks(&self) -> Vec<AckSignal> {
        self.ack_rx.try_iter().collect()
    }

    /// Which periodic jobs are due at `now_us`, advancing their internal
    /// clocks as a side effect. Call once per scheduler loop iteration.
    pub fn due_ticks(&mut self, cfg: &Config, now_us: i64) -> Vec<Tick> {
        let mut due = Vec::new();
        let maintenance_us = (cfg.maintenance_tick_secs as i64) * 1_000_000;
        let checks: &[(Tick, i64)] = &[
            (Tick::RapHeartbeat, (cfg.heartbeat_interval_secs as i64) * 1_000_000),
            (Tick::RapRouteShare, (cfg.route_share_interval_secs as i64) * 1_000_000),
            (Tick::RouteExpiry, maintenance_us),
            (Tick::ChunkCleanup, maintenance_us),
            (Tick::DeliverySweep, maintenance_us),
            (Tick::BoardSyncCheck, maintenance_us),
            (Tick::Announcement, (cfg.announcement_interval_secs as i64) * 1_000_000),
            (Tick::Backup, maintenance_us),
            (Tick::ExpireMessages, maintenance_us),
        ];
        for &(tick, interval_us) in checks {
            if self.clock.due(tick, interval_us, now_us) {
                due.push(tick);
            }
        }
        due
    }

    /// Drive the scheduler forever, invoking `on_tick` for each due job and
    /// `on_ack` for each drained ack signal, sleeping `poll_interval`
    /// between iterations. `now_us` supplies the current time so callers
    /// can substitute a fake clock in tests.
    pub async fn run<TickFn, AckFn, Clock>(&mut self, cfg: &Config, poll_interval: Duration, mut now_us: Clock, mut on_tick: TickFn, mut on_ack: AckFn)
    where
        TickFn: FnMut(Tick),
        AckFn: FnMut(AckSignal),
        Clock: FnMut() -> i64,
    {
        loop {
            let now = now_us();
            for tick in self.due_ticks(cfg, now) {
                on_tick(tick);
            }
            for signal in self.drain_acks() {
                on_ack(signal);
            }
            compio::time::sleep(poll_interval).await;
        }
    }
}
