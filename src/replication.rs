//! The replication multiplexer (spec.md §4.6): fans a store's loaded chains
//! out onto an arbitrary number of concurrent peer streams, and listens on
//! each stream for discovery-key matches it can satisfy locally.
//!
//! Grounded in the same "one shared connection, many logical channels"
//! shape the retrieved hypercore `Feed` abstraction assumes its storage
//! layer provides, except here the multiplexing happens one level up, over
//! whole chains rather than blocks.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{instrument, warn};

use crate::chain::Chain;
use crate::error::Result;
use crate::inner::Inner;
use crate::options::{ChainOptions, GetOptions};
use crate::peer::{PeerEvent, PeerStream};

/// One active replication session: the peer stream itself, plus the handle
/// of the background task draining its announcements. Keeping the handle
/// lets teardown abort that task directly rather than depending on the
/// remote end reciprocating the close.
struct ActiveStream {
    stream: Arc<dyn PeerStream>,
    task: tokio::task::JoinHandle<()>,
}

/// Tracks every peer stream a store is currently replicating over, and the
/// background task reading announcements off each one.
pub struct Multiplexer {
    inner: Arc<Inner>,
    streams: Arc<AsyncRwLock<Vec<ActiveStream>>>,
}

impl Multiplexer {
    pub fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            streams: Arc::new(AsyncRwLock::new(Vec::new())),
        }
    }

    /// Replicates `chains` onto `stream`: subscribes to each chain's
    /// discovery key and hands its current contents over immediately, then
    /// spawns a task that reacts to whatever the remote peer announces in
    /// return.
    #[instrument(skip(self, stream, chains))]
    pub async fn replicate(
        &self,
        stream: Arc<dyn PeerStream>,
        chains: Vec<Arc<dyn Chain>>,
        is_initiator: bool,
        opts: ChainOptions,
    ) -> Result<()> {
        // Each chain's subscribe-then-replicate is independent of every
        // other chain's, so fan them out concurrently rather than waiting on
        // one chain's replicate call before even subscribing the next.
        try_join_all(chains.iter().map(|chain| {
            let stream = stream.clone();
            let opts = opts.clone();
            async move {
                stream.subscribe(chain.discovery_key()).await?;
                chain.replicate(is_initiator, stream, opts).await
            }
        }))
        .await?;

        let inner = self.inner.clone();
        let task_stream = stream.clone();
        let task_opts = opts.clone();
        let task_streams = self.streams.clone();
        let task = tokio::spawn(async move {
            loop {
                match task_stream.next_event().await {
                    Some(PeerEvent::Chain(discovery_key, public_key, entries)) => {
                        if let Err(e) =
                            handle_incoming_chain(&inner, discovery_key, public_key, entries).await
                        {
                            warn!(error = %e, "failed to apply replicated chain entries");
                        }
                    }
                    Some(PeerEvent::Subscribed(discovery_key)) => {
                        // spec.md §4.6 step 4: the remote announced interest
                        // in a discovery key; if we happen to have it on
                        // disk, answer by getting and replicating it back,
                        // even if nobody local has asked for it yet.
                        if let Err(e) = handle_discovery_announcement(
                            &inner,
                            &task_stream,
                            discovery_key,
                            task_opts.clone(),
                        )
                        .await
                        {
                            warn!(error = %e, "failed to answer discovery-key announcement");
                        }
                    }
                    Some(PeerEvent::Closed) | None => break,
                }
            }
            // spec.md §4.6 step 5: once, on finish/end/close, drop this
            // stream from the active set so a later `inject()` never fans a
            // newly-ready chain out onto a stream nobody is reading from
            // anymore.
            task_streams
                .write()
                .await
                .retain(|entry| !Arc::ptr_eq(&entry.stream, &task_stream));
        });

        self.streams.write().await.push(ActiveStream { stream, task });

        Ok(())
    }

    /// Fans a newly-ready chain out onto every currently active stream
    /// (spec.md §4.4 step 7 / §4.6's "injection path"), so a chain opened
    /// after a replication session is already underway still reaches peers
    /// without further user action.
    #[instrument(skip(self, chain))]
    pub async fn inject(&self, chain: Arc<dyn Chain>, opts: ChainOptions) -> Result<()> {
        let streams: Vec<Arc<dyn PeerStream>> = self
            .streams
            .read()
            .await
            .iter()
            .map(|entry| entry.stream.clone())
            .collect();
        try_join_all(streams.into_iter().map(|stream| {
            let chain = chain.clone();
            let opts = opts.clone();
            async move {
                stream.subscribe(chain.discovery_key()).await?;
                chain.replicate(false, stream, opts).await
            }
        }))
        .await?;
        Ok(())
    }

    /// Removes `stream` from the active set, aborts its reader task and
    /// tears down its chain sub-channels without touching the shared
    /// connection itself (spec.md §4.6: closing a replication session never
    /// closes the transport).
    pub async fn unreplicate(&self, stream: &Arc<dyn PeerStream>) -> Result<()> {
        let mut streams = self.streams.write().await;
        let Some(idx) = streams.iter().position(|entry| Arc::ptr_eq(&entry.stream, stream)) else {
            return Ok(());
        };
        let entry = streams.remove(idx);
        drop(streams);
        entry.task.abort();
        entry.stream.close().await
    }

    pub async fn active_stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Destroys every active peer stream, in no particular order, aborts
    /// each one's reader task and drains the active-streams list (spec.md
    /// §4.8's close step 1, "destroy every active peer stream", run before
    /// the engine closes any chain). The reader task is aborted directly
    /// rather than left to notice its own stream's `close()` call, since a
    /// one-sided close that the remote end never reciprocates would
    /// otherwise leave that task (and the `Arc<Inner>` it holds) running
    /// forever.
    #[instrument(skip(self))]
    pub async fn close_all(&self) -> Result<()> {
        let streams: Vec<ActiveStream> = self.streams.write().await.drain(..).collect();
        for entry in streams {
            entry.task.abort();
            entry.stream.close().await?;
        }
        Ok(())
    }
}

async fn handle_incoming_chain(
    inner: &Inner,
    discovery_key: crate::crypto::DiscoveryKey,
    public_key: crate::crypto::PublicKey,
    entries: Vec<Vec<u8>>,
) -> Result<()> {
    let opts = if inner.is_loaded(&discovery_key).await {
        GetOptions::discovery_key(discovery_key)
    } else {
        GetOptions::key(public_key)
    };
    let (chain, _is_new) = inner.get(&opts).await?;
    chain.ready().await?;
    chain.receive_remote(entries).await?;
    inner.release(&discovery_key).await?;
    Ok(())
}

/// Answers one incoming discovery-key announcement: checks whether this
/// node has that chain on disk without instantiating it, and if so, gets
/// and replicates it back onto the stream that announced interest. A
/// miss (or an `UnknownKeypair`/`WrongNameStored` chain-open error) is
/// treated as "we don't have this chain" rather than surfaced to the
/// caller, matching the passive-discovery suppression spec.md §7
/// describes for `UnknownKeypair`.
async fn handle_discovery_announcement(
    inner: &Inner,
    stream: &Arc<dyn PeerStream>,
    discovery_key: crate::crypto::DiscoveryKey,
    opts: ChainOptions,
) -> Result<()> {
    if !inner.exists_on_disk(&discovery_key).await? {
        return Ok(());
    }

    let (chain, _is_new) = inner.get(&GetOptions::discovery_key(discovery_key)).await?;
    let result = async {
        chain.ready().await?;
        chain.replicate(false, stream.clone(), opts).await
    }
    .await;
    inner.release(&discovery_key).await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{InMemoryChain, InMemoryChainFactory};
    use crate::options::GetOptions;
    use crate::peer::InMemoryPeerStream;
    use crate::storage::memory::MemoryStorageFactory;

    fn test_inner() -> Arc<Inner> {
        Arc::new(Inner::new(
            [1u8; 32],
            Arc::new(MemoryStorageFactory::default()),
            Arc::new(InMemoryChainFactory),
            10,
            None,
        ))
    }

    #[tokio::test]
    async fn replicating_a_chain_delivers_its_entries_to_the_peer() {
        let inner_a = test_inner();
        let mux_a = Multiplexer::new(inner_a.clone());
        let inner_b = test_inner();
        let mux_b = Multiplexer::new(inner_b.clone());

        let (chain_a, _) = inner_a.get(&GetOptions::name("shared")).await.unwrap();
        chain_a.ready().await.unwrap();
        let chain_impl = chain_a
            .as_any()
            .downcast_ref::<InMemoryChain>()
            .expect("test double is InMemoryChain");
        chain_impl.append_sync(b"hello");
        chain_impl.append_sync(b"world");

        let (stream_a, stream_b) = InMemoryPeerStream::pair();
        mux_a
            .replicate(stream_a, vec![chain_a.clone()], true, ChainOptions::default())
            .await
            .unwrap();
        mux_b
            .replicate(stream_b, vec![], false, ChainOptions::default())
            .await
            .unwrap();

        // Give the background task a chance to process the injected chain.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (chain_b, _) = inner_b
            .get(&GetOptions::discovery_key(chain_a.discovery_key()))
            .await
            .unwrap();
        chain_b.ready().await.unwrap();
        let chain_b_impl = chain_b.as_any().downcast_ref::<InMemoryChain>().unwrap();
        assert_eq!(chain_b_impl.entries(), vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[tokio::test]
    async fn close_all_drains_the_active_stream_list() {
        let mux = Multiplexer::new(test_inner());
        let (stream_a, _stream_b) = InMemoryPeerStream::pair();
        mux.replicate(stream_a, vec![], true, ChainOptions::default())
            .await
            .unwrap();
        assert_eq!(mux.active_stream_count().await, 1);

        mux.close_all().await.unwrap();
        assert_eq!(mux.active_stream_count().await, 0);
    }

    #[tokio::test]
    async fn a_stream_closed_from_the_remote_end_removes_itself() {
        let mux = Multiplexer::new(test_inner());
        let (stream_a, stream_b) = InMemoryPeerStream::pair();
        mux.replicate(stream_a, vec![], true, ChainOptions::default())
            .await
            .unwrap();
        assert_eq!(mux.active_stream_count().await, 1);

        stream_b.close().await.unwrap();
        // Give the background reader task a chance to observe `Closed` and
        // remove itself from the active-streams list.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(mux.active_stream_count().await, 0);
    }
}
