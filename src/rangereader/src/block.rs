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

//! A decorator that rewrites reads into block-aligned delegate reads.

use crate::Result;
use crate::error::Error;
use crate::reader::{RangeReader, checked_read};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Rewrites arbitrary reads into aligned reads of fixed-size blocks.
///
/// A read of `[offset, offset + length)` is widened to the enclosing
/// block-aligned range (clipped to the source size), fetched from the
/// delegate in one call, and the requested sub-slice is returned.
///
/// An aligner belongs *above* the cache it aligns to: `caller → aligner →
/// cache → backend` makes every cache key a block, so overlapping caller
/// reads deduplicate. The reverse order caches overlapping unaligned ranges
/// and defeats deduplication.
#[derive(Debug)]
pub struct BlockAlignedRangeReader {
    delegate: Arc<dyn RangeReader>,
    block_size: u32,
    source_id: String,
    closed: AtomicBool,
}

impl BlockAlignedRangeReader {
    /// Wraps `delegate`, aligning reads to `block_size` bytes.
    pub fn new<R: RangeReader + 'static>(delegate: R, block_size: u32) -> Result<Self> {
        Self::new_shared(Arc::new(delegate), block_size)
    }

    /// Wraps an already shared delegate.
    pub fn new_shared(delegate: Arc<dyn RangeReader>, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::configuration("the block size must be at least 1"));
        }
        let source_id = format!("block-aligned:{}", delegate.source_id());
        Ok(Self {
            delegate,
            block_size,
            source_id,
            closed: AtomicBool::new(false),
        })
    }

    /// The block size reads are aligned to.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

#[async_trait::async_trait]
impl RangeReader for BlockAlignedRangeReader {
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
            let block_size = self.block_size as u64;
            let aligned_start = (offset / block_size) * block_size;
            let end = offset + length as u64;
            let aligned_end = end.div_ceil(block_size) * block_size;
            let aligned_end = match size {
                Some(size) => std::cmp::min(aligned_end, size),
                None => aligned_end,
            };
            let aligned_length = u32::try_from(aligned_end - aligned_start).map_err(|_| {
                Error::invalid_argument(format!(
                    "a {length}-byte read aligned to {block_size}-byte blocks exceeds the \
                     maximum read length"
                ))
            })?;
            let block = self.delegate.read_range(aligned_start, aligned_length).await?;
            let from = (offset - aligned_start) as usize;
            if from >= block.len() {
                return Ok(Bytes::new());
            }
            let to = std::cmp::min(block.len(), from + length as usize);
            Ok(block.slice(from..to))
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
        self.delegate.close().await
    }
}
