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

//! An in-memory caching decorator.

use crate::error::Error;
use crate::range::ByteRange;
use crate::Result;
use crate::reader::{RangeReader, checked_read};
use bytes::{BufMut as _, Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The weight bound applied when neither a maximum entry count nor a maximum
/// weight is configured. Rust has no collector-driven soft references, so the
/// unbounded mode of the configuration is emulated with a small fixed budget.
const DEFAULT_WEIGHT_BOUND: u64 = 16 * 1024 * 1024;

/// Caches slices of the delegate in memory.
///
/// Without block alignment, the cache key is the exact range the caller
/// requested; repeated reads of the same range hit the cache. With a block
/// size configured, every read is rewritten into aligned block loads that are
/// cached individually, so overlapping reads share blocks instead of caching
/// overlapping ranges redundantly.
///
/// Loads are atomic per key: concurrent readers of the same key wait for a
/// single delegate call and share its buffer. A failed load caches nothing.
///
/// # Example
/// ```no_run
/// # use tileverse_rangereader::cache::memory::MemoryCachingRangeReader;
/// # use tileverse_rangereader::file::FileRangeReader;
/// # use tileverse_rangereader::RangeReader;
/// # tokio_test::block_on(async {
/// let file = FileRangeReader::open("tiles.pmtiles").await?;
/// let reader = MemoryCachingRangeReader::builder(file)
///     .with_max_weight_bytes(64 * 1024 * 1024)
///     .with_block_size(64 * 1024)
///     .build()
///     .await?;
/// let tile = reader.read_range(1_048_576, 4096).await?;
/// # Ok::<(), tileverse_rangereader::Error>(())
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryCachingRangeReader {
    delegate: Arc<dyn RangeReader>,
    cache: moka::future::Cache<ByteRange, Bytes>,
    block_size: u32,
    header: Option<Bytes>,
    source_id: String,
    closed: AtomicBool,
}

/// Builds [MemoryCachingRangeReader] instances.
#[derive(Debug)]
pub struct MemoryCachingRangeReaderBuilder {
    delegate: Arc<dyn RangeReader>,
    max_entries: Option<u64>,
    max_weight_bytes: Option<u64>,
    expire_after_access: Option<Duration>,
    block_size: u32,
    header_size: u32,
}

impl MemoryCachingRangeReaderBuilder {
    /// Bound the cache by entry count. Mutually exclusive with
    /// [with_max_weight_bytes][Self::with_max_weight_bytes].
    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Bound the cache by the summed capacity of the cached buffers.
    /// Mutually exclusive with [with_max_entries][Self::with_max_entries].
    pub fn with_max_weight_bytes(mut self, max_weight_bytes: u64) -> Self {
        self.max_weight_bytes = Some(max_weight_bytes);
        self
    }

    /// Drop entries that have not been read for `duration`.
    pub fn with_expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Rewrite reads into aligned loads of `block_size` bytes, cached per
    /// block. A power of two is recommended; `0` disables alignment.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Eagerly load the first `header_size` bytes at construction and serve
    /// reads within them from an immutable buffer, bypassing the cache.
    pub fn with_header_size(mut self, header_size: u32) -> Self {
        self.header_size = header_size;
        self
    }

    /// Creates the reader, prefetching the header when one is configured.
    pub async fn build(self) -> Result<MemoryCachingRangeReader> {
        if self.max_entries.is_some() && self.max_weight_bytes.is_some() {
            return Err(Error::configuration(
                "configure at most one of max entries and max weight",
            ));
        }
        let weigher = |_: &ByteRange, v: &Bytes| -> u32 {
            v.len().min(u32::MAX as usize).max(1) as u32
        };
        let cache = match (self.max_entries, self.max_weight_bytes) {
            (Some(entries), None) => moka::future::Cache::builder().max_capacity(entries),
            (None, Some(weight)) => moka::future::Cache::builder()
                .weigher(weigher)
                .max_capacity(weight),
            _ => moka::future::Cache::builder()
                .weigher(weigher)
                .max_capacity(DEFAULT_WEIGHT_BOUND),
        };
        let cache = match self.expire_after_access {
            Some(duration) => cache.time_to_idle(duration),
            None => cache,
        };
        let header = match self.header_size {
            0 => None,
            n => Some(self.delegate.read_range(0, n).await?),
        };
        let source_id = format!("memory-cached:{}", self.delegate.source_id());
        Ok(MemoryCachingRangeReader {
            delegate: self.delegate,
            cache: cache.build(),
            block_size: self.block_size,
            header,
            source_id,
            closed: AtomicBool::new(false),
        })
    }
}

/// One aligned block load produced by splitting a caller read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockRequest {
    /// The aligned block range, clipped to the source size; the cache key.
    key: ByteRange,
    /// Where the caller's bytes start within the block.
    offset_within_block: u32,
    /// How many of the block's bytes belong to the caller.
    bytes_to_read: u32,
    /// Where those bytes land in the caller's buffer.
    target_position: u32,
}

/// Splits `[offset, offset + length)` into per-block requests.
fn block_requests(
    offset: u64,
    length: u32,
    block_size: u32,
    size: Option<u64>,
) -> Vec<BlockRequest> {
    let block_size = block_size as u64;
    let end = offset + length as u64;
    let first = offset / block_size;
    let last = (end - 1) / block_size;
    (first..=last)
        .map(|index| {
            let block_start = index * block_size;
            let block_len = match size {
                Some(size) => std::cmp::min(block_size, size - block_start),
                None => block_size,
            };
            let from = std::cmp::max(offset, block_start);
            let to = std::cmp::min(end, block_start + block_len);
            BlockRequest {
                key: ByteRange::new(block_start, block_len as u32),
                offset_within_block: (from - block_start) as u32,
                bytes_to_read: to.saturating_sub(from) as u32,
                target_position: (from - offset) as u32,
            }
        })
        .collect()
}

impl MemoryCachingRangeReader {
    /// Starts building a cache around `delegate`, taking ownership of it.
    pub fn builder<R: RangeReader + 'static>(delegate: R) -> MemoryCachingRangeReaderBuilder {
        Self::builder_shared(Arc::new(delegate))
    }

    /// Starts building a cache around an already shared delegate.
    pub fn builder_shared(delegate: Arc<dyn RangeReader>) -> MemoryCachingRangeReaderBuilder {
        MemoryCachingRangeReaderBuilder {
            delegate,
            max_entries: None,
            max_weight_bytes: None,
            expire_after_access: None,
            block_size: 0,
            header_size: 0,
        }
    }

    /// Loads `key` through the cache; at most one delegate call per key runs
    /// at a time, and errors are not cached.
    async fn load(&self, key: ByteRange) -> Result<Bytes> {
        let delegate = self.delegate.clone();
        self.cache
            .try_get_with(key, async move {
                delegate.read_range(key.offset(), key.length()).await
            })
            .await
            .map_err(Error::shared)
    }

    async fn fetch(&self, size: Option<u64>, offset: u64, length: u32) -> Result<Bytes> {
        if let Some(header) = &self.header {
            let end = offset + length as u64;
            if end <= header.len() as u64 {
                return Ok(header.slice(offset as usize..end as usize));
            }
        }
        if self.block_size == 0 {
            return self.load(ByteRange::new(offset, length)).await;
        }
        let requests = block_requests(offset, length, self.block_size, size);
        let loads = requests.iter().map(|request| self.load(request.key));
        let blocks = futures::future::try_join_all(loads).await?;
        let mut assembled = BytesMut::with_capacity(length as usize);
        for (request, block) in requests.iter().zip(blocks) {
            let from = request.offset_within_block as usize;
            let wanted = from + request.bytes_to_read as usize;
            if from >= block.len() {
                break;
            }
            let to = std::cmp::min(block.len(), wanted);
            assembled.put_slice(&block[from..to]);
            if to < wanted {
                // The block came up short: the source ended inside it.
                break;
            }
        }
        Ok(assembled.freeze())
    }
}

#[async_trait::async_trait]
impl RangeReader for MemoryCachingRangeReader {
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
            self.fetch(size, offset, length).await
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
        self.cache.invalidate_all();
        self.delegate.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::{FlakyReader, InMemoryReader, pattern};

    type TestResult = anyhow::Result<()>;

    #[tokio::test]
    async fn second_read_skips_the_delegate() -> TestResult {
        let delegate = InMemoryReader::new(pattern(100_000));
        let counter = delegate.counter();
        let reader = MemoryCachingRangeReader::builder(delegate)
            .with_max_entries(10)
            .build()
            .await?;

        let first = reader.read_range(1000, 500).await?;
        let second = reader.read_range(1000, 500).await?;
        assert_eq!(first, second);
        assert_eq!(counter.reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() -> TestResult {
        let delegate = FlakyReader::new(pattern(1024), 1);
        let counter = delegate.counter();
        let reader = MemoryCachingRangeReader::builder(delegate)
            .with_max_entries(10)
            .build()
            .await?;

        let err = reader.read_range(0, 100).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io, "{err:?}");
        let got = reader.read_range(0, 100).await?;
        assert_eq!(got.len(), 100);
        assert_eq!(counter.reads(), 2, "the retry must reach the delegate");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_load() -> TestResult {
        let delegate = InMemoryReader::new(pattern(100_000));
        let counter = delegate.counter();
        let reader = Arc::new(
            MemoryCachingRangeReader::builder(delegate)
                .with_max_weight_bytes(1 << 20)
                .build()
                .await?,
        );

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let reader = reader.clone();
                tokio::spawn(async move { reader.read_range(4096, 256).await })
            })
            .collect();
        for task in tasks {
            let got = task.await??;
            assert_eq!(got.len(), 256);
        }
        assert_eq!(counter.reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn multi_block_read_assembles_in_order() -> TestResult {
        let data = pattern(10_000);
        let delegate = InMemoryReader::new(data.clone());
        let counter = delegate.counter();
        let reader = MemoryCachingRangeReader::builder(delegate)
            .with_max_entries(100)
            .with_block_size(1024)
            .build()
            .await?;

        let got = reader.read_range(1500, 3000).await?;
        assert_eq!(&got[..], &data[1500..4500]);
        assert_eq!(counter.reads(), 4);
        assert_eq!(
            counter.ranges(),
            vec![
                ByteRange::new(1024, 1024),
                ByteRange::new(2048, 1024),
                ByteRange::new(3072, 1024),
                ByteRange::new(4096, 1024),
            ]
        );

        // Overlapping read: every block is already cached.
        let again = reader.read_range(2000, 2000).await?;
        assert_eq!(&again[..], &data[2000..4000]);
        assert_eq!(counter.reads(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn trailing_block_is_clipped_to_size() -> TestResult {
        let data = pattern(2500);
        let delegate = InMemoryReader::new(data.clone());
        let counter = delegate.counter();
        let reader = MemoryCachingRangeReader::builder(delegate)
            .with_max_entries(100)
            .with_block_size(1024)
            .build()
            .await?;

        let got = reader.read_range(2000, 1000).await?;
        assert_eq!(&got[..], &data[2000..2500]);
        assert_eq!(
            counter.ranges(),
            vec![ByteRange::new(1024, 1024), ByteRange::new(2048, 452)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn header_reads_bypass_cache_and_delegate() -> TestResult {
        let data = pattern(100_000);
        let delegate = InMemoryReader::new(data.clone());
        let counter = delegate.counter();
        let reader = MemoryCachingRangeReader::builder(delegate)
            .with_max_entries(10)
            .with_header_size(16_384)
            .build()
            .await?;
        assert_eq!(counter.reads(), 1, "construction prefetches the header");

        let got = reader.read_range(0, 1000).await?;
        assert_eq!(&got[..], &data[0..1000]);
        let got = reader.read_range(16_000, 384).await?;
        assert_eq!(&got[..], &data[16_000..16_384]);
        assert_eq!(counter.reads(), 1);

        // A read crossing the header boundary goes to the cache path.
        let got = reader.read_range(16_000, 1000).await?;
        assert_eq!(&got[..], &data[16_000..17_000]);
        assert_eq!(counter.reads(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn sizing_options_are_mutually_exclusive() {
        let delegate = InMemoryReader::new(pattern(64));
        let err = MemoryCachingRangeReader::builder(delegate)
            .with_max_entries(10)
            .with_max_weight_bytes(1024)
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
    }

    #[tokio::test]
    async fn source_id_is_prefixed() -> TestResult {
        let reader = MemoryCachingRangeReader::builder(InMemoryReader::new(pattern(64)))
            .build()
            .await?;
        assert_eq!(reader.source_id(), "memory-cached:memory://test");
        Ok(())
    }

    #[tokio::test]
    async fn close_invalidates_and_closes_delegate_once() -> TestResult {
        let delegate = InMemoryReader::new(pattern(64));
        let counter = delegate.counter();
        let reader = MemoryCachingRangeReader::builder(delegate).build().await?;
        reader.close().await?;
        reader.close().await?;
        assert_eq!(counter.closes(), 1);
        Ok(())
    }

    #[test]
    fn block_request_arithmetic() {
        let requests = block_requests(1500, 3000, 1024, Some(10_000));
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].key, ByteRange::new(1024, 1024));
        assert_eq!(requests[0].offset_within_block, 476);
        assert_eq!(requests[0].bytes_to_read, 548);
        assert_eq!(requests[0].target_position, 0);
        assert_eq!(requests[3].key, ByteRange::new(4096, 1024));
        assert_eq!(requests[3].offset_within_block, 0);
        assert_eq!(requests[3].bytes_to_read, 404);
        assert_eq!(requests[3].target_position, 2596);
        let total: u32 = requests.iter().map(|r| r.bytes_to_read).sum();
        assert_eq!(total, 3000);
    }

    #[test]
    fn block_request_single_block() {
        let requests = block_requests(100, 50, 1024, Some(10_000));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key, ByteRange::new(0, 1024));
        assert_eq!(requests[0].offset_within_block, 100);
        assert_eq!(requests[0].bytes_to_read, 50);
        assert_eq!(requests[0].target_position, 0);
    }
}
