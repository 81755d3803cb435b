//! The storage contract consumed by the chain factory, plus the two
//! backends the crate ships: a directory-backed default and an in-memory one
//! for tests. Mirrors the shape of `tvix_castore`'s `BlobService`/`BlobReader`/
//! `BlobWriter` traits: a small async trait standing in for a pluggable
//! byte-addressable storage backend.

pub mod fs;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Size/metadata about a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
}

/// A random-access, byte-addressable handle to a single named object.
///
/// Implementations must distinguish "object does not exist" ([`Error::NotFound`])
/// from other I/O failures, since the key-aware storage shim (see
/// `crate::inner`) relies on that distinction to decide whether a chain is
/// being created for the first time.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads `length` bytes starting at `offset`. Returns [`Error::NotFound`]
    /// if the object doesn't exist, and a short read (fewer bytes than
    /// requested because the object is shorter than `offset + length`) is
    /// left to the caller to detect via the returned buffer's length.
    ///
    /// Returns [`Bytes`] rather than `Vec<u8>` so a caller handing the same
    /// read off to several places (e.g. the key-aware shim verifying a
    /// persisted name while also handing it to a chain) can clone cheaply
    /// instead of copying the buffer.
    async fn read(&self, offset: u64, length: u64) -> Result<Bytes>;

    /// Writes `data` at `offset`, creating the object if it doesn't exist.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Returns size metadata, or [`Error::NotFound`] if the object is absent.
    async fn stat(&self) -> Result<Stat>;

    /// Releases any resources (file descriptors, locks) held by this handle.
    async fn close(&self) -> Result<()>;
}

/// Constructs a [`Storage`] handle for a logical, chain-internal relative
/// path (e.g. `"key"`, `"secret_key"`, `"tree"`, `"data"`).
///
/// This is the "Storage Router" of the spec: callers never see filesystem
/// paths directly, only this factory closure, the same role the `create`
/// closure plays in the retrieved hypercore `Storage::new(create)`
/// constructor.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn open(&self, relative_path: &str) -> Result<Arc<dyn Storage>>;
}

impl fmt::Debug for dyn StorageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageFactory")
    }
}

/// Wraps any `Fn(&str) -> ...` closure as a [`StorageFactory`], for callers
/// who want to plug in their own backend without writing a full `impl`
/// block — the Rust equivalent of the JS contract's "either a function or a
/// directory path" union, minus the `BadStorage` runtime check: the type
/// system already rules out anything else.
pub struct FnStorageFactory<F>(F);

impl<F> FnStorageFactory<F>
where
    F: Fn(&str) -> Result<Arc<dyn Storage>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> StorageFactory for FnStorageFactory<F>
where
    F: Fn(&str) -> Result<Arc<dyn Storage>> + Send + Sync,
{
    async fn open(&self, relative_path: &str) -> Result<Arc<dyn Storage>> {
        (self.0)(relative_path)
    }
}
