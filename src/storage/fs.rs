use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{Stat, Storage, StorageFactory};
use crate::error::Result;

/// The directory-backed default [`StorageFactory`]: every relative path
/// passed to [`open`](StorageFactory::open) becomes a file under `root`,
/// creating parent directories as needed. Grounded in
/// `SimpleFilesystemBlobService`, minus its content-addressed sharding
/// (chain paths are already sharded by the caller before they reach here —
/// see `crate::inner::chain_path`) and minus its write-to-tmp-then-rename
/// staging (chain files are mutable structured state, not write-once
/// content-addressed blobs, so in-place writes are correct here).
#[derive(Clone)]
pub struct FsStorageFactory {
    root: PathBuf,
}

impl FsStorageFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageFactory for FsStorageFactory {
    #[instrument(skip(self), fields(storage.path = relative_path))]
    async fn open(&self, relative_path: &str) -> Result<Arc<dyn Storage>> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let locked = path.ends_with("bitfield");

        Ok(Arc::new(FileStorage { path, locked }))
    }
}

pub struct FileStorage {
    path: PathBuf,
    /// Whether this handle should attempt an advisory exclusive lock.
    locked: bool,
}

impl FileStorage {
    async fn open_file(&self, write: bool) -> Result<tokio::fs::File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if write {
            options.write(true).create(true);
        }
        let file = options.open(&self.path).await?;

        if self.locked {
            try_lock_best_effort(&file).await;
        }

        Ok(file)
    }
}

/// Attempts an advisory exclusive lock, logging and continuing on failure:
/// the lock is a concurrency nicety (bounding concurrent writers to a single
/// chain's bitfield file on platforms that support `flock`), not a
/// correctness requirement, so its absence must never fail the open.
async fn try_lock_best_effort(file: &tokio::fs::File) {
    let raw = file.try_clone().await;
    let Ok(raw) = raw else {
        debug!("could not clone file handle to attempt advisory lock");
        return;
    };
    let result = tokio::task::spawn_blocking(move || raw.into_std().try_lock_exclusive()).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "advisory file lock unavailable, continuing without it"),
        Err(e) => debug!(error = %e, "advisory file lock task failed, continuing without it"),
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = self.open_file(false).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        let mut total = 0usize;
        loop {
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.open_file(true).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn stat(&self) -> Result<Stat> {
        let file = self.open_file(false).await?;
        let metadata = file.metadata().await?;
        Ok(Stat {
            size: metadata.len(),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Splits a discovery key's lowercase hex encoding into the two-level prefix
/// directories spec.md mandates, bounding directory fanout on
/// case-insensitive filesystems: `abcdef01...` becomes `ab/cd/abcdef01...`.
/// A pure, filesystem-free function, the same shape as
/// `SimpleFilesystemBlobService::derive_path`.
pub fn shard(discovery_key_hex: &str) -> PathBuf {
    let a = &discovery_key_hex[0..2];
    let b = &discovery_key_hex[2..4];
    Path::new(a).join(b).join(discovery_key_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_splits_two_level_prefix() {
        let got = shard("abcdef0123456789");
        assert_eq!(got, PathBuf::from("ab/cd/abcdef0123456789"));
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FsStorageFactory::new(dir.path());
        let handle = factory.open("nested/key").await.unwrap();
        handle.write(0, b"hello world").await.unwrap();
        let got = handle.read(0, 11).await.unwrap();
        assert_eq!(&got[..], &b"hello world"[..]);
        assert_eq!(handle.stat().await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FsStorageFactory::new(dir.path());
        let handle = factory.open("missing").await.unwrap();
        assert!(matches!(
            handle.stat().await,
            Err(crate::error::Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn bitfield_files_attempt_a_lock_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FsStorageFactory::new(dir.path());
        let handle = factory.open("d/bitfield").await.unwrap();
        handle.write(0, b"x").await.unwrap();
    }
}
