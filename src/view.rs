//! The namespaced view (spec.md §4.7): the public facade this crate
//! exposes. A root [`Store`] owns the master secret, the chain cache and
//! the replication multiplexer; every [`Store::namespace`] call returns a
//! cheap clone sharing all of that state but prefixing the names it
//! resolves, so two unrelated subsystems sharing one process never collide
//! on a chain name without an explicit shared root.

use std::collections::HashSet;
use std::sync::Arc;

use data_encoding::HEXLOWER;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, instrument, warn};

use crate::chain::{Chain, ChainFactory};
use crate::crypto::{self, DiscoveryKey};
use crate::error::Result;
use crate::inner::Inner;
use crate::options::{ChainOptions, GetOptions, StoreOptions};
use crate::peer::PeerStream;
use crate::replication::Multiplexer;
use crate::storage::StorageFactory;

/// Lifecycle notifications for chains this store has opened, delivered on
/// the channel returned by [`Store::events`]. There is no per-event
/// acknowledgement; a lagging subscriber simply misses older events, the
/// same trade-off `tokio::sync::broadcast` always makes.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ChainReady(DiscoveryKey),
    ChainError(DiscoveryKey, String),
    ChainClosed(DiscoveryKey),
}

struct Shared {
    inner: Arc<Inner>,
    multiplexer: Multiplexer,
    events_tx: broadcast::Sender<StoreEvent>,
}

/// The collection-wide factory and lifecycle manager for a set of chains
/// sharing one storage root and one master secret.
pub struct Store {
    shared: Arc<Shared>,
    namespace: Option<String>,
    opened: AsyncMutex<HashSet<DiscoveryKey>>,
}

const MASTER_KEY_PATH: &str = "master_key";
const DEFAULT_EVENT_CAPACITY: usize = 256;

impl Store {
    /// Opens (or initializes) a store rooted at `storage`. If no master
    /// secret is supplied via [`StoreOptions::master_key`], one is loaded
    /// from `storage`'s `master_key` object, generating and persisting a
    /// fresh one on first use (spec.md §4.2).
    #[instrument(skip(storage, chain_factory, opts))]
    pub async fn open(
        storage: Arc<dyn StorageFactory>,
        chain_factory: Arc<dyn ChainFactory>,
        opts: StoreOptions,
    ) -> Result<Self> {
        let master = match opts.master_key {
            Some(master) => master,
            None => load_or_create_master(storage.as_ref()).await?,
        };

        let inner = Arc::new(Inner::new(
            master,
            storage,
            chain_factory,
            opts.cache_size,
            opts.cache.clone(),
        ));
        let multiplexer = Multiplexer::new(inner.clone());
        let (events_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                inner,
                multiplexer,
                events_tx,
            }),
            namespace: None,
            opened: AsyncMutex::new(HashSet::new()),
        })
    }

    pub fn is_root(&self) -> bool {
        self.namespace.is_none()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.shared.events_tx.subscribe()
    }

    /// The same event feed as [`Store::events`], wrapped as a [`Stream`] for
    /// callers who'd rather `.next().await` or compose it with other
    /// streams than poll a raw `broadcast::Receiver`. A subscriber that
    /// falls behind silently skips the events it missed, same as
    /// `events()` — `BroadcastStreamRecvError::Lagged` is filtered out
    /// rather than surfaced as a stream item.
    pub fn event_stream(&self) -> impl Stream<Item = StoreEvent> + Send + 'static {
        BroadcastStream::new(self.events()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "event_stream subscriber lagged, skipping missed events");
                None
            }
        })
    }

    /// Returns a child view sharing this store's cache, master secret and
    /// replication streams, but resolving names under `"{this}:{name}"`
    /// instead of bare `name` (spec.md §4.7 step 2-3).
    pub fn namespace(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        let full = match &self.namespace {
            Some(parent) => format!("{parent}:{name}"),
            None => name,
        };
        Self {
            shared: self.shared.clone(),
            namespace: Some(full),
            opened: AsyncMutex::new(HashSet::new()),
        }
    }

    /// Resolves `opts` (qualified by this view's namespace, if any) to a
    /// chain handle, opening or reusing a cached one as needed. The
    /// returned handle is not guaranteed ready yet; await
    /// [`Chain::ready`](crate::chain::Chain::ready) if a caller needs that
    /// guarantee, or subscribe to [`Store::events`] for a notification.
    ///
    /// Implements spec.md §4.7's `maybe_increment`: this view contributes at
    /// most one cache reference per chain no matter how many times it calls
    /// `get` for the same id, so a second call for an id this view already
    /// owns fetches the cached handle directly instead of asking
    /// [`Inner::get`](crate::inner::Inner::get) (which would add another
    /// reference on every call).
    #[instrument(skip(self, opts))]
    pub async fn get(&self, opts: GetOptions) -> Result<Arc<dyn Chain>> {
        let qualified = opts.qualify(self.namespace.as_deref());
        self.get_resolved(qualified).await
    }

    /// This view's own default chain (spec.md §4.7: "equivalent to
    /// `get({...opts, name: view.name})`"). Every view has an implicit
    /// name of its own to derive from — `"default"` at the root (spec.md
    /// §3) — so unlike a bare `get(GetOptions::default_flag())` at the
    /// root, this never fails with `MissingName`. The name is already
    /// fully resolved (nested namespaces were concatenated once, in
    /// [`Store::namespace`]), so it bypasses `qualify` rather than risking
    /// a second, double prefix.
    #[instrument(skip(self, chain_opts))]
    pub async fn default(&self, chain_opts: ChainOptions) -> Result<Arc<dyn Chain>> {
        let name = self.namespace.clone().unwrap_or_else(|| "default".to_string());
        self.get_resolved(GetOptions::name(name).with_chain_options(chain_opts))
            .await
    }

    async fn get_resolved(&self, qualified: GetOptions) -> Result<Arc<dyn Chain>> {
        let chain_opts = qualified.chain.clone();
        let discovery_key = self.shared.inner.resolve_discovery_key(&qualified)?;

        let mut opened = self.opened.lock().await;
        let chain = if opened.contains(&discovery_key) {
            drop(opened);
            self.shared
                .inner
                .cached(&discovery_key)
                .await
                .expect("a chain this view owns must still be present in the cache")
        } else {
            let (chain, is_new) = self.shared.inner.get(&qualified).await?;
            opened.insert(discovery_key);
            drop(opened);
            if is_new {
                self.spawn_injection(chain.clone(), chain_opts);
            }
            chain
        };

        self.spawn_ready_event(chain.clone(), discovery_key);
        Ok(chain)
    }

    /// Waits for a chain to signal readiness and republishes the outcome on
    /// [`Store::events`]. Harmless to call more than once for the same
    /// chain: `Chain::ready` is idempotent once it has already resolved.
    ///
    /// A chain that fails to open is unconditionally evicted from the cache
    /// (spec.md §4.4 step 7's "error: ... remove from cache"), regardless of
    /// how many views still hold a reference to it. `UnknownKeypair` is
    /// swallowed rather than surfaced on [`Store::events`] — a passive
    /// discovery-key lookup that finds nothing locally is expected, not
    /// exceptional — but is still logged at `debug` level as a diagnostic
    /// trail (spec.md §9's open question on this).
    fn spawn_ready_event(&self, chain: Arc<dyn Chain>, discovery_key: DiscoveryKey) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match chain.ready().await {
                Ok(()) => {
                    let _ = shared.events_tx.send(StoreEvent::ChainReady(discovery_key));
                }
                Err(e) => {
                    if let Err(close_err) = shared.inner.evict_errored(&discovery_key).await {
                        warn!(error = %close_err, "failed to close chain that errored during open");
                    }
                    if matches!(e, crate::error::Error::UnknownKeypair) {
                        debug!(
                            discovery_key = %HEXLOWER.encode(&discovery_key),
                            "passive discovery-key lookup found nothing locally"
                        );
                    } else {
                        let _ = shared
                            .events_tx
                            .send(StoreEvent::ChainError(discovery_key, e.to_string()));
                    }
                }
            }
        });
    }

    /// Once a newly-instantiated chain becomes ready, fans it out onto
    /// every replication stream already active on this store (spec.md
    /// §4.4 step 7 / §4.6: "when any new chain is instantiated via get, the
    /// factory iterates the active-streams list and replicates that chain
    /// onto each"). A chain that errors on open (e.g. `UnknownKeypair`) is
    /// never injected — there is nothing local to offer a peer.
    fn spawn_injection(&self, chain: Arc<dyn Chain>, chain_opts: ChainOptions) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if chain.ready().await.is_err() {
                return;
            }
            if let Err(e) = shared.multiplexer.inject(chain, chain_opts).await {
                warn!(error = %e, "failed to inject newly-ready chain into active replication streams");
            }
        });
    }

    pub async fn is_loaded(&self, discovery_key: &DiscoveryKey) -> bool {
        self.shared.inner.is_loaded(discovery_key).await
    }

    /// True only if the chain is cached *and* some view currently owns it
    /// (spec.md §4.4's `is_external`), as opposed to [`Store::is_loaded`]
    /// which is also true for an unowned chain awaiting LRU eviction.
    pub async fn is_external(&self, discovery_key: &DiscoveryKey) -> bool {
        self.shared.inner.is_external(discovery_key).await
    }

    /// A snapshot of the discovery keys this view currently owns a
    /// reference to (spec.md §4.7's `list()`).
    pub async fn list(&self) -> Vec<DiscoveryKey> {
        self.opened.lock().await.iter().copied().collect()
    }

    /// Replicates chains over `stream`. A root store fans out every chain
    /// currently cached anywhere in the store; a namespaced view fans out
    /// only the chains it personally opened (spec.md §4.6's "root
    /// replicates everything, a namespace replicates its own slice").
    #[instrument(skip(self, stream))]
    pub async fn replicate(
        &self,
        stream: Arc<dyn PeerStream>,
        is_initiator: bool,
        opts: ChainOptions,
    ) -> Result<()> {
        let chains = if self.is_root() {
            self.shared.inner.loaded_chains().await
        } else {
            let opened = self.opened.lock().await;
            let mut chains = Vec::with_capacity(opened.len());
            for dk in opened.iter() {
                if let Some(chain) = self.shared.inner.cached(dk).await {
                    chains.push(chain);
                }
            }
            chains
        };
        self.shared
            .multiplexer
            .replicate(stream, chains, is_initiator, opts)
            .await
    }

    pub async fn unreplicate(&self, stream: &Arc<dyn PeerStream>) -> Result<()> {
        self.shared.multiplexer.unreplicate(stream).await
    }

    /// Releases every chain this view opened. A root store additionally
    /// closes every peer stream it is replicating over and clears the
    /// entire cache, since there is no parent view left to keep it alive
    /// (spec.md §4.7's close semantics).
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let opened: Vec<DiscoveryKey> = self.opened.lock().await.drain().collect();
        for dk in opened {
            self.shared.inner.release(&dk).await?;
            let _ = self.shared.events_tx.send(StoreEvent::ChainClosed(dk));
        }

        if self.is_root() {
            // spec.md §4.8 / §9: tear the graph down streams-first, then
            // chains, so no replication task is still trying to inject a
            // chain that's about to be closed out from under it.
            self.shared.multiplexer.close_all().await?;
            self.shared.inner.close_all().await?;
        }

        Ok(())
    }
}

async fn load_or_create_master(storage: &dyn StorageFactory) -> Result<[u8; 32]> {
    let handle = storage.open(MASTER_KEY_PATH).await?;
    match handle.stat().await {
        Ok(stat) if stat.size == 32 => {
            let bytes = handle.read(0, 32).await?;
            let mut master = [0u8; 32];
            master.copy_from_slice(&bytes);
            Ok(master)
        }
        _ => {
            let master = crypto::random_master_secret();
            handle.write(0, &master).await?;
            Ok(master)
        }
    }
}
