//! The `PeerStream` contract: one physical connection to a remote peer,
//! multiplexed across many chains by discovery key (spec.md §1, §4.6).
//! Like [`crate::chain::Chain`], the real wire protocol is out of scope —
//! this crate only needs to subscribe to discovery-key announcements on a
//! stream and inject (or receive) per-chain sub-channels.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::crypto::{DiscoveryKey, PublicKey};
use crate::error::Result;

/// One physical connection, capable of carrying many chains' replication
/// traffic at once. A concrete implementation owns the wire framing; this
/// crate only needs to know which discovery keys the remote side announces
/// and to be able to hand it a chain to replicate once a match is found.
#[async_trait]
pub trait PeerStream: Send + Sync {
    /// Announces interest in a discovery key to the remote peer, and opens
    /// a logical sub-channel for it. Spec.md §4.6: "subscribes in both
    /// directions; whichever side learns of a match first injects the
    /// corresponding chain into the stream."
    async fn subscribe(&self, discovery_key: DiscoveryKey) -> Result<()>;

    /// Called by `Chain::replicate` once a chain is ready to exchange data
    /// for `discovery_key`. For a real wire implementation this writes onto
    /// the sub-channel opened by `subscribe`; the in-memory test double
    /// below uses it to hand whole log contents to the other end directly.
    /// The public key travels alongside the entries so a reader who only
    /// knew the discovery key (spec.md §4.3's passive lookup) can recover
    /// the keypair needed to verify and store what it receives.
    async fn inject_chain(
        &self,
        discovery_key: DiscoveryKey,
        public_key: PublicKey,
        entries: Vec<Vec<u8>>,
    ) -> Result<()>;

    /// Tears down every chain sub-channel without closing the underlying
    /// connection (spec.md §4.6: "stream teardown on finish/end/close must
    /// not also close the shared connection").
    async fn close(&self) -> Result<()>;

    /// Waits for the next event the remote side announced on this stream.
    /// Returns `None` once the stream is closed and no further events will
    /// arrive.
    async fn next_event(&self) -> Option<PeerEvent>;
}

/// An event delivered to one end of an [`InMemoryPeerStream`] pair.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Subscribed(DiscoveryKey),
    Chain(DiscoveryKey, PublicKey, Vec<Vec<u8>>),
    Closed,
}

/// A loopback pair of peer streams wired directly to each other's event
/// channels, standing in for a real transport in this crate's own tests —
/// the same role the teacher's in-memory stores play for traits it doesn't
/// ship a production backend for.
pub struct InMemoryPeerStream {
    outbox: mpsc::UnboundedSender<PeerEvent>,
    inbox: Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl InMemoryPeerStream {
    /// Builds a connected pair: events sent on one side arrive on the other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            outbox: tx_b,
            inbox: Mutex::new(rx_a),
        });
        let b = Arc::new(Self {
            outbox: tx_a,
            inbox: Mutex::new(rx_b),
        });
        // Wire each side's sender into the other's receiver by swapping:
        // `a` sends on tx_b (delivered to b's rx_b) and receives from rx_a
        // (fed by b's tx_a). This mirrors a loopback socket pair.
        (a, b)
    }

    /// Waits for and returns the next event this end received.
    pub async fn recv(&self) -> Option<PeerEvent> {
        self.inbox.lock().await.recv().await
    }
}

#[async_trait]
impl PeerStream for InMemoryPeerStream {
    async fn subscribe(&self, discovery_key: DiscoveryKey) -> Result<()> {
        let _ = self.outbox.send(PeerEvent::Subscribed(discovery_key));
        Ok(())
    }

    async fn inject_chain(
        &self,
        discovery_key: DiscoveryKey,
        public_key: PublicKey,
        entries: Vec<Vec<u8>>,
    ) -> Result<()> {
        let _ = self
            .outbox
            .send(PeerEvent::Chain(discovery_key, public_key, entries));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.outbox.send(PeerEvent::Closed);
        Ok(())
    }

    async fn next_event(&self) -> Option<PeerEvent> {
        self.recv().await
    }
}
