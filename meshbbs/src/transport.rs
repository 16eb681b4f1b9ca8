//! The radio transport boundary.
//!
//! The actual driver (LoRa/Meshtastic firmware bridge) is an external
//! collaborator; this module only defines the contract it must satisfy
//! and a [`LoopbackTransport`] test double. The mesh-level ACK signal is
//! the one piece that genuinely needs care: the radio library delivers it
//! on a thread it owns, not ours, so it is handed to us only as a
//! `flume::Sender<AckSignal>` at construction time. The transport pushes
//! into that channel from its own thread; the scheduler drains it from
//! cooperative context. Nothing here ever blocks the foreign thread
//! waiting for a cooperative task to wake — that coupling is exactly the
//! defect this design avoids (see the scheduler module for the drain
//! side).

use std::time::Duration;

use async_trait::async_trait;

/// Outcome of an awaited-ack unicast send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Delivered,
    TimedOut,
    Failed,
}

/// A mesh-level delivery signal for a previously sent frame, identified
/// by the transport's own send handle. Delivered on whatever thread the
/// radio library uses; never constructed from cooperative context.
#[derive(Debug, Clone)]
pub struct AckSignal {
    pub send_id: u64,
    pub outcome: AckOutcome,
}

/// One inbound frame from the mesh.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub sender_node: String,
    pub channel: String,
    pub text: String,
}

/// Contract consumed from the radio layer. Implementations own whatever
/// thread they need internally; callers only ever see the async methods
/// below plus the `flume::Receiver<AckSignal>` they were handed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_unicast(&self, peer_node: &str, text: &str) -> std::io::Result<()>;

    async fn send_unicast_await_ack(&self, peer_node: &str, text: &str, timeout: Duration) -> std::io::Result<AckOutcome>;

    async fn broadcast(&self, channel: &str, text: &str) -> std::io::Result<()>;

    /// Receive the next inbound frame. Returns `None` when the transport
    /// has shut down.
    async fn recv(&self) -> Option<Inbound>;
}

/// In-memory transport for tests: unicasts are delivered to a paired
/// `LoopbackTransport` via channels, with every awaited-ack send
/// reporting immediate delivery.
pub struct LoopbackTransport {
    inbound_rx: flume::Receiver<Inbound>,
    peer_tx: flume::Sender<Inbound>,
    self_node: String,
}

impl LoopbackTransport {
    /// Build a connected pair of loopback transports identified by
    /// `node_a` and `node_b`; a unicast sent by one arrives on the
    /// other's `recv()`.
    pub fn pair(node_a: &str, node_b: &str) -> (Self, Self) {
        let (tx_a, rx_a) = flume::unbounded();
        let (tx_b, rx_b) = flume::unbounded();
        (
            Self {
                inbound_rx: rx_a,
                peer_tx: tx_b,
                self_node: node_a.to_string(),
            },
            Self {
                inbound_rx: rx_b,
                peer_tx: tx_a,
                self_node: node_b.to_string(),
            },
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_unicast(&self, _peer_node: &str, text: &str) -> std::io::Result<()> {
        let _ = self.peer_tx.send(Inbound {
            sender_node: self.self_node.clone(),
            channel: "unicast".to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_unicast_await_ack(&self, peer_node: &str, text: &str, _timeout: Duration) -> std::io::Result<AckOutcome> {
        self.send_unicast(peer_node, text).await?;
        Ok(AckOutcome::Delivered)
    }

    async fn broadcast(&self, channel: &str, text: &str) -> std::io::Result<()> {
        let _ = self.peer_tx.send(Inbound {
            sender_node: self.self_node.clone(),
            channel: channel.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound_rx.recv_async().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn loopback_delivers_unicast() {
        let (a, b) = LoopbackTransport::pair("!a", "!b");
        a.send_unicast("!b", "hello").await.unwrap();
        let inbound = b.recv().await.unwrap();
        assert_eq!(inbound.sender_node, "!a");
        assert_eq!(inbound.text, "hello");
    }

    #[compio::test]
    async fn awaited_ack_reports_delivered() {
        let (a, b) = LoopbackTransport::pair("!a", "!b");
        let outcome = a.send_unicast_await_ack("!b", "hi", Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, AckOutcome::Delivered);
        assert!(b.recv().await.is_some());
    }
}
