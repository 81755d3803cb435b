//! The chain factory (spec.md §4.4): resolves a `GetOptions` value against
//! the master secret, serves cached handles, and otherwise builds a fresh
//! per-chain storage view — sharded under the discovery key and wrapped in
//! a key-aware shim that lets a chain recover its keypair across restarts
//! without ever persisting the secret key to disk unprompted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use data_encoding::HEXLOWER;
use tracing::{instrument, warn};

use crate::cache::ChainCache;
use crate::chain::{Chain, ChainFactory};
use crate::crypto::{self, DiscoveryKey, PublicKey, SecretKey};
use crate::error::{Error, Result};
use crate::options::{GetOptions, SubCache};
use crate::resolver::{self, ResolvedKeys};
use crate::storage::{Stat, Storage, StorageFactory};

pub struct Inner {
    master: [u8; 32],
    root_storage: Arc<dyn StorageFactory>,
    chain_factory: Arc<dyn ChainFactory>,
    cache: ChainCache,
    /// The store-wide sub-cache, if any (`StoreOptions::cache`). Scoped down
    /// to a fresh per-chain namespace in `Inner::get`, never handed to a
    /// chain directly, so two chains never share cache keys.
    root_cache: Option<Arc<dyn SubCache>>,
}

impl Inner {
    pub fn new(
        master: [u8; 32],
        root_storage: Arc<dyn StorageFactory>,
        chain_factory: Arc<dyn ChainFactory>,
        cache_size: usize,
        root_cache: Option<Arc<dyn SubCache>>,
    ) -> Self {
        Self {
            master,
            root_storage,
            chain_factory,
            cache: ChainCache::new(cache_size),
            root_cache,
        }
    }

    pub fn master_secret(&self) -> &[u8; 32] {
        &self.master
    }

    /// Resolves `opts` without touching storage or the cache — cheap enough
    /// to call just to find out which id a request would land on (used by
    /// `crate::view::Store` to dedupe repeat `get`s from the same view
    /// before deciding whether a new reference is warranted).
    pub fn resolve_discovery_key(&self, opts: &GetOptions) -> Result<DiscoveryKey> {
        resolver::resolve(&self.master, opts).map(|r| r.discovery_key)
    }

    /// Resolves `opts` and returns a (possibly newly opened) chain handle,
    /// incrementing its cache reference. Callers own the resulting
    /// reference and must release it via [`Inner::release`] when done. The
    /// returned `bool` is `true` iff this call is what instantiated the
    /// chain (as opposed to finding it already cached), which is exactly
    /// when spec.md §4.6's injection path needs to fan the chain out onto
    /// every live replication stream once it's ready.
    #[instrument(skip(self, opts))]
    pub async fn get(&self, opts: &GetOptions) -> Result<(Arc<dyn Chain>, bool)> {
        let resolved = resolver::resolve(&self.master, opts)?;
        let key_hex = HEXLOWER.encode(&resolved.discovery_key);

        if let Some(chain) = self.cache.get(&key_hex).await {
            self.cache.increment(&key_hex).await;
            return Ok((chain, false));
        }

        let chain_storage = self.chain_storage(&key_hex, &resolved);
        let create_if_missing = resolved.public_key.is_some();
        let chain_cache = self.chain_cache(&key_hex, opts);
        let chain = self.chain_factory.open(
            chain_storage,
            resolved.public_key,
            create_if_missing,
            opts.chain.clone(),
            chain_cache,
        );
        self.cache.insert(key_hex, chain.clone()).await;
        Ok((chain, true))
    }

    /// Implements spec.md §4.4's "check-if-exists-on-disk": reads the `key`
    /// file at the sharded path a discovery key would resolve to, without
    /// instantiating a chain. Used by the replication multiplexer to decide
    /// whether to answer a peer's discovery-key announcement.
    pub async fn exists_on_disk(&self, discovery_key: &DiscoveryKey) -> Result<bool> {
        let key_hex = HEXLOWER.encode(discovery_key);
        let prefix = crate::storage::fs::shard(&key_hex);
        let storage = PrefixedStorageFactory {
            inner: self.root_storage.clone(),
            prefix,
        };
        let handle = match storage.open("key").await {
            Ok(handle) => handle,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        match handle.read(0, 32).await {
            Ok(bytes) => Ok(bytes.len() == 32),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Releases one reference to the chain behind `discovery_key`. If that
    /// was the last reference, the chain is evicted from the cache and
    /// closed, matching spec.md §4.7's "close the chain when the last
    /// reference is released".
    pub async fn release(&self, discovery_key: &crate::crypto::DiscoveryKey) -> Result<()> {
        let key_hex = HEXLOWER.encode(discovery_key);
        if self.cache.decrement(&key_hex).await {
            if let Some(chain) = self.cache.delete(&key_hex).await {
                chain.close().await?;
            }
        }
        Ok(())
    }

    pub async fn is_loaded(&self, discovery_key: &crate::crypto::DiscoveryKey) -> bool {
        let key_hex = HEXLOWER.encode(discovery_key);
        self.cache.has(&key_hex).await
    }

    /// Unconditionally evicts and closes a chain, regardless of outstanding
    /// references (spec.md §4.4 step 7's "error: release the if_available
    /// gate; remove from cache" — a chain that failed to become ready has
    /// nothing usable to offer whichever views still hold a reference to it).
    pub async fn evict_errored(&self, discovery_key: &crate::crypto::DiscoveryKey) -> Result<()> {
        let key_hex = HEXLOWER.encode(discovery_key);
        if let Some(chain) = self.cache.delete(&key_hex).await {
            chain.close().await?;
        }
        Ok(())
    }

    /// The number of distinct views currently holding a reference to this
    /// chain, or `None` if it isn't cached at all.
    pub async fn ref_count(&self, discovery_key: &crate::crypto::DiscoveryKey) -> Option<u32> {
        let key_hex = HEXLOWER.encode(discovery_key);
        self.cache.entry(&key_hex).await.map(|(_, refs)| refs)
    }

    /// `is_external` (spec.md §4.4): true only if the chain is cached *and*
    /// at least one view currently owns it, as opposed to [`Inner::is_loaded`]
    /// which is also true for a chain sitting in the cache unowned, pending
    /// LRU eviction.
    pub async fn is_external(&self, discovery_key: &crate::crypto::DiscoveryKey) -> bool {
        self.ref_count(discovery_key).await.is_some_and(|refs| refs > 0)
    }

    /// Peeks a cached chain without affecting its refcount.
    pub async fn cached(&self, discovery_key: &crate::crypto::DiscoveryKey) -> Option<Arc<dyn Chain>> {
        let key_hex = HEXLOWER.encode(discovery_key);
        self.cache.get(&key_hex).await
    }

    /// Every chain currently cached, regardless of refcount — used by a
    /// root store's `replicate()` to fan its entire loaded set out onto a
    /// new peer stream.
    pub async fn loaded_chains(&self) -> Vec<Arc<dyn Chain>> {
        self.cache.all().await
    }

    /// Tears down every cached chain, for a root store's `close()`.
    pub async fn close_all(&self) -> Result<()> {
        for chain in self.cache.drain().await {
            chain.close().await?;
        }
        Ok(())
    }

    /// Resolves the sub-cache this chain should get, per spec.md §4.4 step
    /// 5: a per-`get` `opts.cache` overrides the store-wide one, and either
    /// way the result is namespaced by this chain's own id, so no two
    /// chains ever see the same sub-cache keys even if the caller passed
    /// the identical `SubCache` handle to every `get` call.
    fn chain_cache(&self, key_hex: &str, opts: &GetOptions) -> Option<Arc<dyn SubCache>> {
        opts.cache
            .as_ref()
            .or(self.root_cache.as_ref())
            .map(|cache| cache.namespace(key_hex))
    }

    fn chain_storage(&self, key_hex: &str, resolved: &ResolvedKeys) -> Arc<dyn StorageFactory> {
        let prefix = crate::storage::fs::shard(key_hex);
        let namespaced = Arc::new(PrefixedStorageFactory {
            inner: self.root_storage.clone(),
            prefix,
        });
        Arc::new(KeyedStorage {
            inner: namespaced,
            resolved: resolved.clone(),
            master: self.master,
        })
    }
}

/// Prefixes every relative path with a fixed directory before delegating,
/// giving each chain its own sharded subtree of the root storage root
/// (spec.md §4.4 step 3). Grounded in the same sharding convention as
/// `crate::storage::fs::shard`, but kept storage-backend agnostic so it
/// works over a memory-backed root just as well as a filesystem one.
struct PrefixedStorageFactory {
    inner: Arc<dyn StorageFactory>,
    prefix: PathBuf,
}

#[async_trait]
impl StorageFactory for PrefixedStorageFactory {
    async fn open(&self, relative_path: &str) -> Result<Arc<dyn Storage>> {
        let joined = self.prefix.join(relative_path);
        let joined = joined.to_str().ok_or(Error::Io("non-utf8 storage path".into()))?;
        self.inner.open(joined).await
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Key,
    SecretKey,
}

/// Intercepts a chain's `key`/`secret_key` logical files (spec.md §4.4 step
/// 4). Everything else passes straight through to the sharded per-chain
/// storage.
struct KeyedStorage {
    inner: Arc<dyn StorageFactory>,
    resolved: ResolvedKeys,
    master: [u8; 32],
}

#[async_trait]
impl StorageFactory for KeyedStorage {
    async fn open(&self, relative_path: &str) -> Result<Arc<dyn Storage>> {
        let kind = match relative_path {
            "key" => Some(Kind::Key),
            "secret_key" => Some(Kind::SecretKey),
            _ => None,
        };
        match kind {
            Some(kind) => Ok(Arc::new(KeyShim {
                kind,
                inner: self.inner.open(relative_path).await?,
                resolved: self.resolved.clone(),
                master: self.master,
            })),
            None => self.inner.open(relative_path).await,
        }
    }
}

/// On-disk tag byte distinguishing a persisted derivation name from a raw
/// public key, so a later passive lookup (only a discovery key known) can
/// tell which convention was used when the file was first written, instead
/// of guessing from content length alone.
const TAG_PUBLIC_KEY: u8 = 0;
const TAG_NAME: u8 = 1;

struct KeyShim {
    kind: Kind,
    inner: Arc<dyn Storage>,
    resolved: ResolvedKeys,
    master: [u8; 32],
}

enum Persisted {
    Name(Vec<u8>),
    PublicKey(PublicKey),
}

impl KeyShim {
    async fn read_persisted(&self) -> Result<Option<Persisted>> {
        match self.inner.stat().await {
            Ok(stat) if stat.size > 0 => {
                let bytes = self.inner.read(0, stat.size).await?;
                match bytes.first() {
                    Some(&TAG_NAME) => Ok(Some(Persisted::Name(bytes[1..].to_vec()))),
                    Some(&TAG_PUBLIC_KEY) if bytes.len() == 33 => {
                        let mut pk = [0u8; 32];
                        pk.copy_from_slice(&bytes[1..33]);
                        Ok(Some(Persisted::PublicKey(pk)))
                    }
                    _ => Ok(None),
                }
            }
            Ok(_) => Ok(None),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves the effective (public_key, secret_key) pair, applying
    /// spec.md §4.4 step 4's precedence: persisted name on disk first,
    /// then the resolver's own keys, then `UnknownKeypair`.
    async fn effective_keys(&self) -> Result<(PublicKey, Option<SecretKey>)> {
        if let Some(persisted) = self.read_persisted().await? {
            return match persisted {
                Persisted::Name(name) => {
                    let seed = crypto::derive(&self.master, &name);
                    let (public_key, secret_key) = crypto::keypair(&seed);
                    if crypto::discovery_key_of(&public_key) != self.resolved.discovery_key {
                        warn!("persisted chain name does not reproduce the expected discovery key");
                        return Err(Error::WrongNameStored);
                    }
                    Ok((public_key, Some(secret_key)))
                }
                Persisted::PublicKey(public_key) => Ok((public_key, None)),
            };
        }

        if let Some(public_key) = self.resolved.public_key {
            return Ok((public_key, self.resolved.secret_key));
        }

        Err(Error::UnknownKeypair)
    }
}

fn slice(full: &[u8], offset: u64, length: u64) -> Bytes {
    let start = (offset as usize).min(full.len());
    let end = ((offset + length) as usize).min(full.len());
    if start >= end {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&full[start..end])
    }
}

#[async_trait]
impl Storage for KeyShim {
    async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let (public_key, secret_key) = self.effective_keys().await?;
        match self.kind {
            Kind::Key => Ok(slice(&public_key, offset, length)),
            Kind::SecretKey => match secret_key {
                Some(sk) => Ok(slice(&sk, offset, length)),
                None => Err(Error::NotFound),
            },
        }
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self.kind {
            Kind::Key => {
                let payload = match &self.resolved.name {
                    Some(name) => {
                        let mut v = vec![TAG_NAME];
                        v.extend_from_slice(name);
                        v
                    }
                    None => {
                        let mut v = vec![TAG_PUBLIC_KEY];
                        if data.len() == 32 {
                            v.extend_from_slice(data);
                        } else if let Some(public_key) = self.resolved.public_key {
                            v.extend_from_slice(&public_key);
                        } else {
                            return Err(Error::UnknownKeypair);
                        }
                        v
                    }
                };
                self.inner.write(0, &payload).await
            }
            Kind::SecretKey => self.inner.write(offset, data).await,
        }
    }

    async fn stat(&self) -> Result<Stat> {
        let (_, secret_key) = self.effective_keys().await?;
        match self.kind {
            Kind::Key => Ok(Stat { size: 32 }),
            Kind::SecretKey => match secret_key {
                Some(_) => Ok(Stat { size: 64 }),
                None => Err(Error::NotFound),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChainFactory;
    use crate::options::GetOptions;
    use crate::storage::memory::MemoryStorageFactory;

    fn inner() -> Inner {
        Inner::new(
            [5u8; 32],
            Arc::new(MemoryStorageFactory::default()),
            Arc::new(InMemoryChainFactory),
            10,
            None,
        )
    }

    #[tokio::test]
    async fn get_by_name_then_ready_resolves_keys() {
        let inner = inner();
        let (chain, is_new) = inner.get(&GetOptions::name("alice")).await.unwrap();
        assert!(is_new);
        chain.ready().await.unwrap();
        assert!(chain.writable());
    }

    #[tokio::test]
    async fn same_name_returns_cached_handle() {
        let inner = inner();
        let (a, a_is_new) = inner.get(&GetOptions::name("alice")).await.unwrap();
        let (b, b_is_new) = inner.get(&GetOptions::name("alice")).await.unwrap();
        assert!(a_is_new);
        assert!(!b_is_new);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn reopen_by_discovery_key_after_name_creation_recovers_keypair() {
        let inner = inner();
        let (first, _) = inner.get(&GetOptions::name("alice")).await.unwrap();
        first.ready().await.unwrap();
        let dk = first.discovery_key();
        inner.release(&dk).await.unwrap();

        let (second, is_new) = inner.get(&GetOptions::discovery_key(dk)).await.unwrap();
        assert!(is_new);
        second.ready().await.unwrap();
        assert_eq!(second.public_key(), first.public_key());
    }

    #[tokio::test]
    async fn discovery_key_only_with_nothing_on_disk_is_unknown_keypair() {
        let inner = inner();
        let dk = [9u8; 32];
        let (chain, _) = inner.get(&GetOptions::discovery_key(dk)).await.unwrap();
        let err = chain.ready().await.unwrap_err();
        assert!(matches!(err, Error::UnknownKeypair));
    }

    #[tokio::test]
    async fn exists_on_disk_is_false_until_a_chain_is_created_there() {
        let inner = inner();
        let dk_opts = GetOptions::name("alice");
        let dk = inner.resolve_discovery_key(&dk_opts).unwrap();
        assert!(!inner.exists_on_disk(&dk).await.unwrap());

        let (chain, _) = inner.get(&dk_opts).await.unwrap();
        chain.ready().await.unwrap();
        assert!(inner.exists_on_disk(&dk).await.unwrap());
    }

    /// A `SubCache` test double that records every namespace it was asked
    /// to scope down to, so tests can assert two chains never collide on
    /// the same sub-cache key.
    #[derive(Default)]
    struct RecordingSubCache {
        namespaces: std::sync::Mutex<Vec<String>>,
    }

    impl crate::options::SubCache for RecordingSubCache {
        fn namespace(&self, name: &str) -> Arc<dyn crate::options::SubCache> {
            self.namespaces.lock().unwrap().push(name.to_string());
            Arc::new(RecordingSubCache::default())
        }
    }

    #[tokio::test]
    async fn distinct_chains_get_distinct_sub_cache_namespaces() {
        let root_cache = Arc::new(RecordingSubCache::default());
        let inner = Inner::new(
            [5u8; 32],
            Arc::new(MemoryStorageFactory::default()),
            Arc::new(InMemoryChainFactory),
            10,
            Some(root_cache.clone() as Arc<dyn crate::options::SubCache>),
        );

        let (alice, _) = inner.get(&GetOptions::name("alice")).await.unwrap();
        let (bob, _) = inner.get(&GetOptions::name("bob")).await.unwrap();
        alice.ready().await.unwrap();
        bob.ready().await.unwrap();

        let alice_cache = alice
            .as_any()
            .downcast_ref::<crate::chain::InMemoryChain>()
            .unwrap()
            .cache();
        let bob_cache = bob
            .as_any()
            .downcast_ref::<crate::chain::InMemoryChain>()
            .unwrap()
            .cache();
        assert!(alice_cache.is_some());
        assert!(bob_cache.is_some());

        let namespaces = root_cache.namespaces.lock().unwrap().clone();
        assert_eq!(namespaces.len(), 2);
        assert_ne!(namespaces[0], namespaces[1]);
    }

    #[tokio::test]
    async fn externally_supplied_key_roundtrips_without_a_name() {
        let inner = inner();
        let seed = crypto::derive(&[5u8; 32], b"external");
        let (pk, _) = crypto::keypair(&seed);
        let (chain, _) = inner.get(&GetOptions::key(pk)).await.unwrap();
        chain.ready().await.unwrap();
        assert_eq!(chain.public_key(), pk);
        assert!(!chain.writable());
    }
}
