// Copyright 2025 Tileverse
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An on-disk caching decorator.

use crate::error::Error;
use crate::range::ByteRange;
use crate::reader::{RangeReader, checked_read};
use crate::{Result, unpoisoned};
use bytes::{Bytes, BytesMut};
use sha2::Digest as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Persists slices of the delegate as files under a cache directory.
///
/// Each cached range lives in its own file named
/// `{hash8(source_id)}_{offset}_{length}.bin`, holding exactly the bytes of
/// that range. An in-memory index tracks the files as a weighted LRU, with
/// weights equal to file sizes; inserting past the size bound evicts the
/// least recently used files from disk.
///
/// The directory is shared state: on construction the index is rebuilt from
/// the files already present for this source, and files deleted externally
/// degrade to misses that refetch and rewrite. Unreadable cache files are
/// treated as misses, never surfaced.
///
/// # Example
/// ```no_run
/// # use tileverse_rangereader::cache::disk::DiskCachingRangeReader;
/// # use tileverse_rangereader::http::HttpRangeReader;
/// # use tileverse_rangereader::RangeReader;
/// # tokio_test::block_on(async {
/// let http = HttpRangeReader::builder("https://example.com/planet.pmtiles")?.build()?;
/// let reader = DiskCachingRangeReader::builder(http)
///     .with_directory("/var/cache/tiles")
///     .with_max_size_bytes(512 * 1024 * 1024)
///     .build()
///     .await?;
/// let tile = reader.read_range(1_048_576, 4096).await?;
/// # Ok::<(), tileverse_rangereader::Error>(())
/// # });
/// ```
#[derive(Debug)]
pub struct DiskCachingRangeReader {
    delegate: Arc<dyn RangeReader>,
    directory: PathBuf,
    max_size: u64,
    delete_on_close: bool,
    hash: String,
    source_id: String,
    index: Mutex<Index>,
    inflight: Mutex<HashMap<ByteRange, watch::Receiver<bool>>>,
    closed: AtomicBool,
}

#[derive(Debug)]
struct Index {
    entries: lru::LruCache<ByteRange, u64>,
    total: u64,
}

/// Builds [DiskCachingRangeReader] instances.
#[derive(Debug)]
pub struct DiskCachingRangeReaderBuilder {
    delegate: Arc<dyn RangeReader>,
    directory: Option<PathBuf>,
    max_size: u64,
    delete_on_close: bool,
}

impl DiskCachingRangeReaderBuilder {
    /// The directory holding the cache files. Defaults to
    /// `tileverse-rangereader` under the system temporary directory.
    pub fn with_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.directory = Some(directory.as_ref().to_path_buf());
        self
    }

    /// The bound on the summed size of the cache files. Defaults to 1 GiB.
    pub fn with_max_size_bytes(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Delete this reader's cache files when it is closed.
    pub fn with_delete_on_close(mut self, delete_on_close: bool) -> Self {
        self.delete_on_close = delete_on_close;
        self
    }

    /// Creates the reader, scanning the directory for cache files left by
    /// earlier readers of the same source.
    pub async fn build(self) -> Result<DiskCachingRangeReader> {
        if self.max_size == 0 {
            return Err(Error::configuration("the cache size bound must be positive"));
        }
        let directory = self
            .directory
            .unwrap_or_else(|| std::env::temp_dir().join("tileverse-rangereader"));
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(Error::io)?;
        let hash = hash8(self.delegate.source_id());
        let source_id = format!("disk-cached:{}", self.delegate.source_id());
        let index = {
            let directory = directory.clone();
            let hash = hash.clone();
            tokio::task::spawn_blocking(move || scan_directory(&directory, &hash))
                .await
                .map_err(Error::io)??
        };
        Ok(DiskCachingRangeReader {
            delegate: self.delegate,
            directory,
            max_size: self.max_size,
            delete_on_close: self.delete_on_close,
            hash,
            source_id,
            index: Mutex::new(index),
            inflight: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

/// The first 8 hex characters of the SHA-256 of `source_id`, the per-source
/// namespace inside a shared cache directory.
fn hash8(source_id: &str) -> String {
    hex::encode(&sha2::Sha256::digest(source_id.as_bytes())[..4])
}

/// Parses `{hash8}_{offset}_{length}.bin` file names.
fn parse_entry_name(name: &str) -> Option<(&str, ByteRange)> {
    let stem = name.strip_suffix(".bin")?;
    let mut parts = stem.split('_');
    let hash = parts.next()?;
    let offset = parts.next()?.parse::<u64>().ok()?;
    let length = parts.next()?.parse::<u32>().ok()?;
    if parts.next().is_some() || hash.len() != 8 {
        return None;
    }
    Some((hash, ByteRange::new(offset, length)))
}

fn scan_directory(directory: &Path, hash: &str) -> Result<Index> {
    let mut entries = lru::LruCache::unbounded();
    let mut total = 0_u64;
    for entry in std::fs::read_dir(directory).map_err(Error::io)? {
        let entry = entry.map_err(Error::io)?;
        let name = entry.file_name();
        let Some((file_hash, range)) = name.to_str().and_then(parse_entry_name) else {
            continue;
        };
        if file_hash != hash {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        entries.put(range, metadata.len());
        total += metadata.len();
    }
    tracing::debug!(
        directory = %directory.display(),
        entries = entries.len(),
        bytes = total,
        "recovered disk cache index"
    );
    Ok(Index { entries, total })
}

/// Removes the in-flight marker and wakes the waiters when the load ends,
/// also on error and cancellation.
struct InflightGuard<'a> {
    reader: &'a DiskCachingRangeReader,
    key: ByteRange,
    _tx: watch::Sender<bool>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        unpoisoned(self.reader.inflight.lock()).remove(&self.key);
        // Dropping the sender wakes every waiter.
    }
}

impl DiskCachingRangeReader {
    /// Starts building a cache around `delegate`, taking ownership of it.
    pub fn builder<R: RangeReader + 'static>(delegate: R) -> DiskCachingRangeReaderBuilder {
        Self::builder_shared(Arc::new(delegate))
    }

    /// Starts building a cache around an already shared delegate.
    pub fn builder_shared(delegate: Arc<dyn RangeReader>) -> DiskCachingRangeReaderBuilder {
        DiskCachingRangeReaderBuilder {
            delegate,
            directory: None,
            max_size: DEFAULT_MAX_SIZE,
            delete_on_close: false,
        }
    }

    /// The directory holding this reader's cache files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, key: &ByteRange) -> PathBuf {
        self.directory.join(format!(
            "{}_{}_{}.bin",
            self.hash,
            key.offset(),
            key.length()
        ))
    }

    fn forget(&self, key: &ByteRange) {
        let mut index = unpoisoned(self.index.lock());
        if let Some(weight) = index.entries.pop(key) {
            index.total -= weight;
        }
    }

    /// Serves `key` from disk, or returns `None` after reconciling the index
    /// when the file is gone or unreadable.
    async fn try_cached(&self, key: &ByteRange) -> Option<Bytes> {
        let hit = unpoisoned(self.index.lock()).entries.get(key).is_some();
        if !hit {
            return None;
        }
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "cache file removed externally");
                self.forget(key);
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache file");
                self.forget(key);
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    async fn load_and_store(&self, key: ByteRange) -> Result<Bytes> {
        let bytes = self.delegate.read_range(key.offset(), key.length()).await?;
        // A short read at the end of the source caches under its real length.
        let store_key = ByteRange::new(key.offset(), bytes.len() as u32);
        if store_key.is_empty() {
            return Ok(bytes);
        }
        let path = self.entry_path(&store_key);
        if let Err(e) = self.write_entry(&path, &bytes).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write cache file");
            return Ok(bytes);
        }
        let evicted = {
            let mut index = unpoisoned(self.index.lock());
            if let Some(old) = index.entries.pop(&store_key) {
                index.total -= old;
            }
            index.entries.put(store_key, bytes.len() as u64);
            index.total += bytes.len() as u64;
            let mut paths = Vec::new();
            while index.total > self.max_size {
                let Some((victim, weight)) = index.entries.pop_lru() else {
                    break;
                };
                index.total -= weight;
                paths.push(self.entry_path(&victim));
            }
            paths
        };
        for path in evicted {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to evict cache file");
            }
        }
        Ok(bytes)
    }

    async fn write_entry(&self, path: &Path, bytes: &Bytes) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }

    async fn fetch(&self, offset: u64, length: u32) -> Result<Bytes> {
        let key = ByteRange::new(offset, length);
        if length as u64 > self.max_size {
            // Never cacheable: go straight to the delegate.
            return self.delegate.read_range(offset, length).await;
        }
        enum Role<'a> {
            Loader(InflightGuard<'a>),
            Waiter(watch::Receiver<bool>),
        }
        loop {
            if let Some(bytes) = self.try_cached(&key).await {
                return Ok(bytes);
            }
            let role = {
                let mut inflight = unpoisoned(self.inflight.lock());
                match inflight.get(&key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        inflight.insert(key, rx);
                        Role::Loader(InflightGuard {
                            reader: self,
                            key,
                            _tx: tx,
                        })
                    }
                }
            };
            match role {
                Role::Waiter(mut rx) => {
                    // The loader dropping its sender ends this wait.
                    let _ = rx.changed().await;
                    continue;
                }
                Role::Loader(_guard) => return self.load_and_store(key).await,
            }
        }
    }

    fn remove_own_files(&self) -> Result<()> {
        let prefix = format!("{}_", self.hash);
        for entry in std::fs::read_dir(&self.directory).map_err(Error::io)? {
            let entry = entry.map_err(Error::io)?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.starts_with(&prefix)) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %e,
                        "failed to delete cache file on close");
                }
            }
        }
        // Best effort: the directory may be shared with other sources.
        let _ = std::fs::remove_dir(&self.directory);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RangeReader for DiskCachingRangeReader {
    async fn read_range_into(
        &self,
        offset: u64,
        length: u32,
        target: &mut BytesMut,
    ) -> Result<u32> {
        if length == 0 {
            return Ok(0);
        }
        let size = self.delegate.size().await?;
        checked_read(size, offset, length, target, async |offset, length| {
            self.fetch(offset, length).await
        })
        .await
    }

    async fn size(&self) -> Result<Option<u64>> {
        self.delegate.size().await
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let close_result = self.delegate.close().await;
        if self.delete_on_close {
            self.remove_own_files()?;
        }
        close_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryReader, UnknownSizeReader, pattern};

    type TestResult = anyhow::Result<()>;

    async fn cached_reader(
        data: Vec<u8>,
        dir: &Path,
    ) -> Result<(crate::testing::ReadCounter, DiskCachingRangeReader)> {
        let delegate = InMemoryReader::new(data);
        let counter = delegate.counter();
        let reader = DiskCachingRangeReader::builder(delegate)
            .with_directory(dir)
            .build()
            .await?;
        Ok((counter, reader))
    }

    #[test]
    fn entry_names_round_trip() {
        let (hash, range) = parse_entry_name("a1b2c3d4_2000_300.bin").unwrap();
        assert_eq!(hash, "a1b2c3d4");
        assert_eq!(range, ByteRange::new(2000, 300));
        assert!(parse_entry_name("a1b2c3d4_2000_300.tmp").is_none());
        assert!(parse_entry_name("short_1_2.bin").is_none());
        assert!(parse_entry_name("a1b2c3d4_x_2.bin").is_none());
        assert!(parse_entry_name("a1b2c3d4_1_2_3.bin").is_none());
    }

    #[test]
    fn hash8_is_stable_and_short() {
        let hash = hash8("memory://test");
        assert_eq!(hash.len(), 8);
        assert_eq!(hash, hash8("memory://test"));
        assert_ne!(hash, hash8("memory://other"));
    }

    #[tokio::test]
    async fn miss_writes_file_then_hit_skips_delegate() -> TestResult {
        let data = pattern(100_000);
        let dir = tempfile::tempdir()?;
        let (counter, reader) = cached_reader(data.clone(), dir.path()).await?;

        let first = reader.read_range(2000, 300).await?;
        assert_eq!(&first[..], &data[2000..2300]);
        assert_eq!(counter.reads(), 1);

        let name = format!("{}_2000_300.bin", hash8("memory://test"));
        let on_disk = std::fs::read(dir.path().join(&name))?;
        assert_eq!(&on_disk[..], &data[2000..2300]);

        let second = reader.read_range(2000, 300).await?;
        assert_eq!(first, second);
        assert_eq!(counter.reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn external_deletion_degrades_to_miss() -> TestResult {
        let data = pattern(100_000);
        let dir = tempfile::tempdir()?;
        let (counter, reader) = cached_reader(data.clone(), dir.path()).await?;

        let first = reader.read_range(2000, 300).await?;
        let path = dir.path().join(format!("{}_2000_300.bin", hash8("memory://test")));
        std::fs::remove_file(&path)?;

        let second = reader.read_range(2000, 300).await?;
        assert_eq!(first, second);
        assert_eq!(counter.reads(), 2, "exactly one refetch");
        assert!(path.exists(), "the cache file is recreated");
        Ok(())
    }

    #[tokio::test]
    async fn reopening_serves_prior_ranges_without_delegate_calls() -> TestResult {
        let data = pattern(50_000);
        let dir = tempfile::tempdir()?;
        let (_, reader) = cached_reader(data.clone(), dir.path()).await?;
        reader.read_range(1000, 500).await?;
        reader.read_range(9000, 250).await?;
        reader.close().await?;

        let (counter, reopened) = cached_reader(data.clone(), dir.path()).await?;
        let got = reopened.read_range(1000, 500).await?;
        assert_eq!(&got[..], &data[1000..1500]);
        let got = reopened.read_range(9000, 250).await?;
        assert_eq!(&got[..], &data[9000..9250]);
        assert_eq!(counter.reads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn eviction_keeps_total_under_bound() -> TestResult {
        let data = pattern(100_000);
        let dir = tempfile::tempdir()?;
        let delegate = InMemoryReader::new(data);
        let reader = DiskCachingRangeReader::builder(delegate)
            .with_directory(dir.path())
            .with_max_size_bytes(1000)
            .build()
            .await?;

        reader.read_range(0, 400).await?;
        reader.read_range(400, 400).await?;
        reader.read_range(800, 400).await?;

        let hash = hash8("memory://test");
        assert!(!dir.path().join(format!("{hash}_0_400.bin")).exists());
        assert!(dir.path().join(format!("{hash}_400_400.bin")).exists());
        assert!(dir.path().join(format!("{hash}_800_400.bin")).exists());
        let total = unpoisoned(reader.index.lock()).total;
        assert!(total <= 1000, "{total}");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_reads_bypass_the_cache() -> TestResult {
        let data = pattern(100_000);
        let dir = tempfile::tempdir()?;
        let delegate = InMemoryReader::new(data.clone());
        let counter = delegate.counter();
        let reader = DiskCachingRangeReader::builder(delegate)
            .with_directory(dir.path())
            .with_max_size_bytes(1000)
            .build()
            .await?;

        let got = reader.read_range(0, 2000).await?;
        assert_eq!(&got[..], &data[0..2000]);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        let got = reader.read_range(0, 2000).await?;
        assert_eq!(&got[..], &data[0..2000]);
        assert_eq!(counter.reads(), 2, "oversized reads are never cached");
        Ok(())
    }

    #[tokio::test]
    async fn partial_reads_cache_under_actual_length() -> TestResult {
        let data = pattern(1000);
        let dir = tempfile::tempdir()?;
        let delegate = UnknownSizeReader::new(data.clone());
        let reader = DiskCachingRangeReader::builder(delegate)
            .with_directory(dir.path())
            .build()
            .await?;

        // The delegate reports no size, so the request is not clamped; the
        // source ends after 100 of the 500 requested bytes.
        let got = reader.read_range(900, 500).await?;
        assert_eq!(got.len(), 100);
        let name = format!("{}_900_100.bin", hash8("memory://unknown-size"));
        assert!(dir.path().join(&name).exists(), "keyed by actual length");
        Ok(())
    }

    #[tokio::test]
    async fn delete_on_close_removes_own_files() -> TestResult {
        let data = pattern(10_000);
        let dir = tempfile::tempdir()?;
        let delegate = InMemoryReader::new(data);
        let reader = DiskCachingRangeReader::builder(delegate)
            .with_directory(dir.path().join("cache"))
            .with_delete_on_close(true)
            .build()
            .await?;
        reader.read_range(0, 100).await?;
        reader.read_range(100, 100).await?;
        reader.close().await?;
        assert!(!dir.path().join("cache").exists(), "empty directory removed");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_load() -> TestResult {
        let data = pattern(100_000);
        let dir = tempfile::tempdir()?;
        let (counter, reader) = cached_reader(data, dir.path()).await?;
        let reader = Arc::new(reader);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let reader = reader.clone();
                tokio::spawn(async move { reader.read_range(5000, 512).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await??.len(), 512);
        }
        assert_eq!(counter.reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn source_id_is_prefixed() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (_, reader) = cached_reader(pattern(64), dir.path()).await?;
        assert_eq!(reader.source_id(), "disk-cached:memory://test");
        Ok(())
    }
}
