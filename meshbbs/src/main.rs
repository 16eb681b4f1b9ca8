//! Daemon entrypoint: loads configuration, opens the store, derives the
//! master key from the operator passphrase, and drives the scheduler
//! loop against a transport.
//!
//! No real radio bridge ships in this crate (the firmware integration is
//! an external collaborator, per spec) — this binary runs against a
//! [`LoopbackTransport`] pair so the wiring can be exercised end to end
//! without hardware. A real deployment swaps in its own [`Transport`].

use std::env;
use std::sync::Arc;
use std::time::Duration;

use futures::{select, FutureExt};
use meshbbs::dev_tracing;
use meshbbs::prelude::*;
use meshbbs_core::config::Config;
use meshbbs_core::crypto::random_salt;
use meshbbs_core::store::Store;
use tracing::info;

#[compio::main]
async fn main() {
    dev_tracing::init_tracing();

    let config_path = env::args().nth(1);
    let cfg = match &config_path {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            eprintln!("failed to load config at {path}: {e}");
            std::process::exit(1);
        }),
        None => Config::default(),
    };

    let passphrase = env::var("MESHBBS_PASSPHRASE").unwrap_or_else(|_| {
        eprintln!("MESHBBS_PASSPHRASE not set; refusing to run with no operator key");
        std::process::exit(1);
    });

    let store = Store::open_in_memory(random_salt()).expect("open store");
    let mut instance = BbsInstance::new(cfg, store, &passphrase, 0).expect("derive master key");

    let (tx, rx) = flume::unbounded::<AckSignal>();
    drop(tx);
    let mut scheduler = Scheduler::new(rx);

    let (local, _peer) = meshbbs::transport::LoopbackTransport::pair("!local", "!peer");
    let transport: Arc<dyn Transport> = Arc::new(local);

    info!(callsign = %instance.cfg.callsign, "meshbbs instance ready");

    loop {
        select! {
            inbound = transport.recv().fuse() => {
                let Some(inbound) = inbound else { break };
                for out in instance.handle_inbound(&inbound.sender_node, &inbound.text, 0) {
                    let _ = transport.send_unicast(&out.to_node_id, &out.text).await;
                }
            }
            _ = compio::time::sleep(Duration::from_secs(1)).fuse() => {
                for tick in scheduler.due_ticks(&instance.cfg, 0) {
                    for out in instance.on_tick(tick, 0) {
                        let _ = transport.send_unicast(&out.to_node_id, &out.text).await;
                    }
                }
            }
        }
    }
}
