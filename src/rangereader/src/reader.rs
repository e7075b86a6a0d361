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

//! The reader contract implemented by every backend and decorator.

use crate::Result;
use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};

/// Random access to the bytes of a single logical source.
///
/// Implementations read arbitrary `(offset, length)` slices from local files,
/// HTTP servers, or object stores. Decorators wrap another reader and add
/// behavior (caching, block alignment) while preserving this contract.
///
/// # Contract
///
/// - `read_range` returns at most `length` bytes. When the source size is
///   known, reads past the end return the available prefix (possibly empty).
/// - Every method is safe to call concurrently from multiple tasks.
/// - `close` is idempotent; decorators close their delegate exactly once.
#[async_trait::async_trait]
pub trait RangeReader: std::fmt::Debug + Send + Sync {
    /// Reads up to `length` bytes starting at `offset` into a new buffer.
    async fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        let mut target = BytesMut::with_capacity(length as usize);
        self.read_range_into(offset, length, &mut target).await?;
        Ok(target.freeze())
    }

    /// Reads up to `length` bytes starting at `offset`, appending them at the
    /// target's write position.
    ///
    /// The target must have at least `length` bytes of remaining capacity.
    /// Returns the number of bytes appended; the write position advances by
    /// exactly that amount and the capacity is left alone.
    async fn read_range_into(&self, offset: u64, length: u32, target: &mut BytesMut)
    -> Result<u32>;

    /// The total size of the source in bytes, or `None` when the source does
    /// not report one (for example an HTTP server without `Content-Length`).
    async fn size(&self) -> Result<Option<u64>>;

    /// A stable identifier for the source of this reader's bytes.
    ///
    /// Decorators prefix the identifier of their delegate (`memory-cached:`,
    /// `disk-cached:`, `block-aligned:`) so a composed pipeline is
    /// self-describing.
    fn source_id(&self) -> &str;

    /// Releases the resources held by this reader.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared argument validation and EOF clamping for `read_range_into`.
///
/// Runs the checks every implementation owes its callers, then delegates the
/// actual fetch: zero-length reads return immediately without I/O, a target
/// without room for `length` bytes is an invalid argument, and when the source
/// size is known the requested range is clamped so the fetch hook never sees a
/// range extending past the end.
///
/// The hook receives the clamped `(offset, length)` and must return exactly
/// the bytes it read, fewer only at an end the size did not predict.
pub(crate) async fn checked_read<F>(
    size: Option<u64>,
    offset: u64,
    length: u32,
    target: &mut BytesMut,
    fetch: F,
) -> Result<u32>
where
    F: AsyncFnOnce(u64, u32) -> Result<Bytes>,
{
    if length == 0 {
        return Ok(0);
    }
    let remaining = target.capacity() - target.len();
    if remaining < length as usize {
        return Err(Error::invalid_argument(format!(
            "target has {remaining} bytes of remaining capacity, the read requires {length}"
        )));
    }
    let effective = match size {
        Some(size) if offset >= size => return Ok(0),
        Some(size) => std::cmp::min(length as u64, size - offset) as u32,
        None => length,
    };
    let bytes = fetch(offset, effective).await?;
    let bytes = if bytes.len() > effective as usize {
        bytes.slice(0..effective as usize)
    } else {
        bytes
    };
    target.put_slice(&bytes);
    Ok(bytes.len() as u32)
}
