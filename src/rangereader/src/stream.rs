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

//! Stream adapters over the reader contract.
//!
//! Thin cursors for callers that want to consume a source front to back or
//! hop around with explicit positioning. Neither adapter owns the wrapped
//! reader; dropping an adapter leaves the reader open.

use crate::Result;
use crate::reader::RangeReader;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Consumes a reader sequentially from offset zero.
#[derive(Debug)]
pub struct SequentialRangeReader {
    reader: Arc<dyn RangeReader>,
    position: u64,
}

impl SequentialRangeReader {
    pub fn new(reader: Arc<dyn RangeReader>) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    /// The offset of the next read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads up to `max` bytes at the cursor and advances it by the bytes
    /// actually read. Returns `None` at the end of the stream.
    pub async fn read(&mut self, max: u32) -> Result<Option<Bytes>> {
        if let Some(size) = self.reader.size().await? {
            if self.position >= size {
                return Ok(None);
            }
        }
        let bytes = self.reader.read_range(self.position, max).await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        self.position += bytes.len() as u64;
        Ok(Some(bytes))
    }
}

/// A repositionable cursor over a reader.
///
/// The cursor is atomic, so the adapter can be shared behind an `Arc` by
/// callers coordinating their own access order.
#[derive(Debug)]
pub struct SeekableRangeReader {
    reader: Arc<dyn RangeReader>,
    position: AtomicU64,
}

impl SeekableRangeReader {
    pub fn new(reader: Arc<dyn RangeReader>) -> Self {
        Self {
            reader,
            position: AtomicU64::new(0),
        }
    }

    /// The offset of the next read.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Moves the cursor to `position`.
    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    /// Reads up to `max` bytes at the cursor and advances it by the bytes
    /// actually read.
    pub async fn read(&self, max: u32) -> Result<Bytes> {
        let position = self.position.load(Ordering::Acquire);
        let bytes = self.reader.read_range(position, max).await?;
        self.position
            .fetch_add(bytes.len() as u64, Ordering::AcqRel);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryReader, pattern};

    type TestResult = anyhow::Result<()>;

    #[tokio::test]
    async fn sequential_reads_whole_source() -> TestResult {
        let data = pattern(2500);
        let reader: Arc<dyn RangeReader> = Arc::new(InMemoryReader::new(data.clone()));
        let mut stream = SequentialRangeReader::new(reader);

        let mut collected = Vec::new();
        while let Some(chunk) = stream.read(1024).await? {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, data);
        assert_eq!(stream.position(), 2500);
        assert!(stream.read(1024).await?.is_none(), "stays at end-of-stream");
        Ok(())
    }

    #[tokio::test]
    async fn seekable_repositioning() -> TestResult {
        let data = pattern(10_000);
        let reader: Arc<dyn RangeReader> = Arc::new(InMemoryReader::new(data.clone()));
        let stream = SeekableRangeReader::new(reader);

        let head = stream.read(100).await?;
        assert_eq!(&head[..], &data[0..100]);
        assert_eq!(stream.position(), 100);

        stream.set_position(5000);
        let jump = stream.read(200).await?;
        assert_eq!(&jump[..], &data[5000..5200]);
        assert_eq!(stream.position(), 5200);
        Ok(())
    }

    #[tokio::test]
    async fn adapters_do_not_close_the_reader() -> TestResult {
        let inner = InMemoryReader::new(pattern(100));
        let counter = inner.counter();
        let reader: Arc<dyn RangeReader> = Arc::new(inner);
        {
            let mut stream = SequentialRangeReader::new(reader.clone());
            let _ = stream.read(10).await?;
        }
        {
            let stream = SeekableRangeReader::new(reader.clone());
            let _ = stream.read(10).await?;
        }
        assert_eq!(counter.closes(), 0);
        let still_readable = reader.read_range(0, 10).await?;
        assert_eq!(still_readable.len(), 10);
        Ok(())
    }
}
