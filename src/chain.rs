//! The `Chain` contract: an append-only, cryptographically-addressed log,
//! consumed but not implemented by this crate (spec.md §1 places the actual
//! Merkle-tree/sparse-replication data structure out of scope, the same way
//! `tvix_castore::blobservice::BlobService` never concerns itself with how
//! bytes are chunked upstream).
//!
//! This module ships the trait plus a minimal in-memory implementation used
//! by this crate's own tests in place of a real chain backend — playing the
//! same role `MemoryBlobService` plays for `BlobService` in the teacher,
//! except here it is test scaffolding rather than a production backend,
//! since production chain implementations live outside this crate entirely.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::crypto::{DiscoveryKey, PublicKey, SecretKey};
use crate::error::Result;
use crate::options::{ChainOptions, SubCache};
use crate::peer::PeerStream;
use crate::storage::StorageFactory;

/// A single append-only log, keyed by an ed25519 public key.
///
/// Implementations return immediately from their constructor (see
/// [`ChainFactory::open`]) and signal true readiness asynchronously via
/// [`Chain::ready`], matching spec.md §4.4's "lazy handle return": callers
/// get a handle before the chain has necessarily finished resolving its
/// keypair from storage.
#[async_trait]
pub trait Chain: Send + Sync {
    /// Escape hatch for tests that need to reach a concrete chain
    /// implementation's own inspection methods (e.g. [`InMemoryChain::entries`]).
    fn as_any(&self) -> &dyn std::any::Any;

    fn public_key(&self) -> PublicKey;
    fn secret_key(&self) -> Option<SecretKey>;
    fn discovery_key(&self) -> DiscoveryKey;
    fn length(&self) -> u64;
    fn writable(&self) -> bool;
    fn is_closed(&self) -> bool;

    /// Resolves once the chain has finished opening, or fails if the
    /// storage shim could not resolve a keypair (`UnknownKeypair`) or found
    /// a mismatched on-disk name (`WrongNameStored`).
    async fn ready(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Replicates this chain onto a peer stream's injected sub-channel.
    async fn replicate(
        &self,
        is_initiator: bool,
        stream: Arc<dyn PeerStream>,
        opts: ChainOptions,
    ) -> Result<()>;

    /// Merges entries received from a peer (via `PeerStream::inject_chain`)
    /// into this chain's local log. Out-of-scope real chain implementations
    /// would verify each entry against the Merkle tree before accepting it;
    /// this crate's contract only requires that entries already present
    /// locally aren't duplicated.
    async fn receive_remote(&self, entries: Vec<Vec<u8>>) -> Result<()>;
}

/// Constructs chain handles. `open` is synchronous and returns immediately
/// (before readiness), per spec.md §4.4 step 6-7 and §5's "get is
/// synchronous" guarantee.
pub trait ChainFactory: Send + Sync {
    /// `cache` is this chain's own sub-namespace of whichever block/tree
    /// sub-cache the store (or the individual `get` call) was configured
    /// with, already scoped by `crate::inner::Inner` so distinct chains
    /// never share cache keys (spec.md §4.4 step 5). `None` if no sub-cache
    /// was configured at all.
    fn open(
        &self,
        storage: Arc<dyn StorageFactory>,
        public_key: Option<PublicKey>,
        create_if_missing: bool,
        opts: ChainOptions,
        cache: Option<Arc<dyn SubCache>>,
    ) -> Arc<dyn Chain>;
}

/// A minimal in-memory chain used by this crate's own tests. Resolves its
/// keypair by reading the `key`/`secret_key` logical files through the
/// supplied storage (so the key-aware shim in `crate::inner` is exercised
/// exactly as a real chain implementation would exercise it), and persists
/// appended entries only in memory.
pub struct InMemoryChain {
    storage: Arc<dyn StorageFactory>,
    /// Not used by the test double's own logic (it has no blocks or tree to
    /// cache); kept only so tests can assert that a distinct sub-namespace
    /// reached each chain.
    cache: Option<Arc<dyn SubCache>>,
    state: RwLock<State>,
}

struct State {
    public_key: Option<PublicKey>,
    secret_key: Option<SecretKey>,
    entries: Vec<Vec<u8>>,
    closed: bool,
}

pub struct InMemoryChainFactory;

impl ChainFactory for InMemoryChainFactory {
    fn open(
        &self,
        storage: Arc<dyn StorageFactory>,
        public_key: Option<PublicKey>,
        _create_if_missing: bool,
        _opts: ChainOptions,
        cache: Option<Arc<dyn SubCache>>,
    ) -> Arc<dyn Chain> {
        Arc::new(InMemoryChain {
            storage,
            cache,
            state: RwLock::new(State {
                public_key,
                secret_key: None,
                entries: Vec::new(),
                closed: false,
            }),
        })
    }
}

impl InMemoryChain {
    pub fn append_sync(&self, data: &[u8]) {
        self.state.write().entries.push(data.to_vec());
    }

    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        self.state.read().entries.get(index).cloned()
    }

    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.state.read().entries.clone()
    }

    pub fn cache(&self) -> Option<Arc<dyn SubCache>> {
        self.cache.clone()
    }

    /// Writes the current entry log out through this chain's own storage, at
    /// the logical `entries` path (untouched by the `key`/`secret_key` shim,
    /// so it passes straight through to the per-chain sharded storage). A
    /// real chain backs its log with the tree/data storage it's handed the
    /// same way; this keeps the test double honest about surviving cache
    /// eviction and reopening, instead of only ever living in process memory.
    async fn persist_entries(&self) -> Result<()> {
        let snapshot = self.entries();
        let handle = self.storage.open("entries").await?;
        handle.write(0, &encode_entries(&snapshot)).await
    }
}

fn encode_entries(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        buf.extend_from_slice(entry);
    }
    buf
}

fn decode_entries(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap()) as usize;
        i += 4;
        if i + len > bytes.len() {
            break;
        }
        entries.push(bytes[i..i + len].to_vec());
        i += len;
    }
    entries
}

#[async_trait]
impl Chain for InMemoryChain {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn public_key(&self) -> PublicKey {
        self.state
            .read()
            .public_key
            .expect("public_key only absent before ready() resolves")
    }

    fn secret_key(&self) -> Option<SecretKey> {
        self.state.read().secret_key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        crate::crypto::discovery_key_of(&self.public_key())
    }

    fn length(&self) -> u64 {
        self.state.read().entries.len() as u64
    }

    fn writable(&self) -> bool {
        self.state.read().secret_key.is_some()
    }

    fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    async fn ready(&self) -> Result<()> {
        // Mimic a real chain resolving its identity through the key-aware
        // storage shim: read "key", and "secret_key" if present.
        let key_handle = self.storage.open("key").await?;
        let public_key_bytes = key_handle.read(0, 32).await?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&public_key_bytes);

        let secret_key = match self.storage.open("secret_key").await {
            Ok(handle) => match handle.read(0, 64).await {
                Ok(bytes) if bytes.len() == 64 => {
                    let mut sk = [0u8; 64];
                    sk.copy_from_slice(&bytes);
                    Some(sk)
                }
                _ => None,
            },
            Err(_) => None,
        };

        // Persist the resolved public key back through the shim, the way a
        // real chain writes its identity on first creation.
        key_handle.write(0, &public_key).await?;

        let persisted_entries = match self.storage.open("entries").await {
            Ok(handle) => match handle.stat().await {
                Ok(stat) if stat.size > 0 => decode_entries(&handle.read(0, stat.size).await?),
                _ => Vec::new(),
            },
            Err(_) => Vec::new(),
        };

        let mut state = self.state.write();
        state.public_key = Some(public_key);
        state.secret_key = secret_key;
        if state.entries.is_empty() {
            state.entries = persisted_entries;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.write().closed = true;
        Ok(())
    }

    async fn replicate(
        &self,
        _is_initiator: bool,
        stream: Arc<dyn PeerStream>,
        _opts: ChainOptions,
    ) -> Result<()> {
        let entries = self.entries();
        stream
            .inject_chain(self.discovery_key(), self.public_key(), entries)
            .await
    }

    async fn receive_remote(&self, entries: Vec<Vec<u8>>) -> Result<()> {
        {
            let mut state = self.state.write();
            for (i, entry) in entries.into_iter().enumerate() {
                if i >= state.entries.len() {
                    state.entries.push(entry);
                }
            }
        }
        self.persist_entries().await
    }
}
