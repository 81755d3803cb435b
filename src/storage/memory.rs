use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::{Stat, Storage, StorageFactory};
use crate::error::{Error, Result};

/// An in-memory [`StorageFactory`], keyed by the relative path passed to
/// [`StorageFactory::open`]. Every distinct relative path gets its own
/// [`MemoryStorage`] handle backed by a shared buffer, so repeated `open`
/// calls for the same path see each other's writes — the in-memory analogue
/// of reopening the same file.
#[derive(Clone, Default)]
pub struct MemoryStorageFactory {
    objects: Arc<RwLock<HashMap<String, Arc<RwLock<Option<Vec<u8>>>>>>>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    #[instrument(skip(self), fields(storage.path = relative_path))]
    async fn open(&self, relative_path: &str) -> Result<Arc<dyn Storage>> {
        let buf = self
            .objects
            .write()
            .entry(relative_path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone();
        Ok(Arc::new(MemoryStorage { buf }))
    }
}

pub struct MemoryStorage {
    buf: Arc<RwLock<Option<Vec<u8>>>>,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let guard = self.buf.read();
        let data = guard.as_ref().ok_or(Error::NotFound)?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(Bytes::new());
        }
        let end = (offset + length as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[offset..end]))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.buf.write();
        let buf = guard.get_or_insert_with(Vec::new);
        let offset = offset as usize;
        if buf.len() < offset + data.len() {
            buf.resize(offset + data.len(), 0);
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn stat(&self) -> Result<Stat> {
        let guard = self.buf.read();
        let data = guard.as_ref().ok_or(Error::NotFound)?;
        Ok(Stat {
            size: data.len() as u64,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
