//! Normalized configuration types consumed by the resolver, the inner
//! factory and the namespaced view — the Rust-typed equivalent of the
//! dynamically-dispatched `opts` union spec.md §4.3/§9 describes, normalized
//! once here instead of re-inspected at every call site.

use std::sync::Arc;

use crate::crypto::{DiscoveryKey, PublicKey, SecretKey};

/// A caller-supplied keypair, as accepted by `GetOptions::key_pair`.
#[derive(Clone, Copy)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: Option<SecretKey>,
}

/// A scoped sub-cache handle, mirroring the `{data?, tree?}` sub-caches with
/// a `namespace()` method spec.md §6 lists among recognized options. Real
/// block/tree caching is owned by the (out-of-scope) `Chain` implementation;
/// this crate only guarantees that every chain gets a distinct namespace so
/// two chains never share cache keys (spec.md §4.4 step 5).
pub trait SubCache: Send + Sync {
    fn namespace(&self, name: &str) -> Arc<dyn SubCache>;
}

/// Per-chain options threaded through to the (out-of-scope) `Chain`
/// constructor, beyond the keying/storage concerns this crate resolves
/// itself. `sparse` is the one named flag the literal end-to-end scenarios
/// in spec.md §8 reference directly; anything else a concrete `Chain`
/// implementation needs can be layered on by wrapping this crate's `Chain`
/// trait, the same way castore backends layer their own config structs atop
/// a shared trait.
#[derive(Clone, Debug, Default)]
pub struct ChainOptions {
    pub sparse: bool,
}

/// One `get`-style request, normalized from the five input shapes spec.md
/// §4.3 enumerates. Construct via the `key`/`discovery_key`/`key_pair`/`name`
/// helpers rather than building the struct directly, so exactly one key
/// specifier is ever set.
#[derive(Clone, Default)]
pub struct GetOptions {
    pub(crate) key: Option<PublicKey>,
    pub(crate) discovery_key: Option<DiscoveryKey>,
    pub(crate) key_pair: Option<KeyPair>,
    pub(crate) name: Option<String>,
    pub(crate) default: bool,
    pub chain: ChainOptions,
    pub cache: Option<Arc<dyn SubCache>>,
}

impl GetOptions {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn key(public_key: PublicKey) -> Self {
        Self {
            key: Some(public_key),
            ..Self::default()
        }
    }

    pub fn discovery_key(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key: Some(discovery_key),
            ..Self::default()
        }
    }

    pub fn key_pair(key_pair: KeyPair) -> Self {
        Self {
            key_pair: Some(key_pair),
            ..Self::default()
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// `{ default: true }` with no name — always resolves to
    /// [`crate::error::Error::MissingName`], matching spec.md §4.3's table.
    pub fn default_flag() -> Self {
        Self {
            default: true,
            ..Self::default()
        }
    }

    pub fn with_chain_options(mut self, chain: ChainOptions) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn SubCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Applies a namespace prefix (see `crate::view::Store::namespace`) to
    /// this request: a `name` input becomes `"{namespace}:{name}"`, and a
    /// bare `{default: true}` becomes `name: namespace` itself — the
    /// namespace's own default chain. Anything keyed by `key`, `key_pair` or
    /// `discovery_key` is untouched: those already name a specific keypair
    /// and namespacing a fixed public key would be meaningless.
    pub(crate) fn qualify(mut self, namespace: Option<&str>) -> Self {
        let Some(ns) = namespace else {
            return self;
        };
        match (&self.name, self.default) {
            (Some(name), _) => self.name = Some(format!("{ns}:{name}")),
            (None, true) => {
                self.name = Some(ns.to_string());
                self.default = false;
            }
            _ => {}
        }
        self
    }
}

/// Engine-wide configuration, supplied once to `Store::open`.
#[derive(Clone)]
pub struct StoreOptions {
    /// Overrides generation/loading of `master_key` on disk. Mutually
    /// exclusive in practice with durable storage that already has one.
    pub master_key: Option<[u8; 32]>,
    /// Soft cap on cached chains with zero refs; eviction never touches
    /// pinned entries (spec.md §4.5, §9).
    pub cache_size: usize,
    pub cache: Option<Arc<dyn SubCache>>,
}

impl StoreOptions {
    pub const DEFAULT_CACHE_SIZE: usize = 1000;
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            master_key: None,
            cache_size: Self::DEFAULT_CACHE_SIZE,
            cache: None,
        }
    }
}
