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

//! Unified byte-range reading for files, HTTP servers, and object stores.
//!
//! Everything in this crate speaks one contract, [RangeReader]: fetch an
//! arbitrary `(offset, length)` slice from a source. Backends implement it
//! for local files, HTTP servers with range support, and S3/Azure/GCS
//! objects; decorators wrap any reader to add in-memory caching, on-disk
//! caching, or block alignment, composing freely.
//!
//! Readers can be built directly:
//!
//! ```no_run
//! use tileverse_rangereader::RangeReader;
//! use tileverse_rangereader::cache::memory::MemoryCachingRangeReader;
//! use tileverse_rangereader::http::HttpRangeReader;
//!
//! # tokio_test::block_on(async {
//! let http = HttpRangeReader::builder("https://example.com/tiles.pmtiles")?.build()?;
//! let reader = MemoryCachingRangeReader::builder(http)
//!     .with_max_weight_bytes(64 * 1024 * 1024)
//!     .with_block_size(64 * 1024)
//!     .build()
//!     .await?;
//! let header = reader.read_range(0, 127).await?;
//! # Ok::<(), tileverse_rangereader::Error>(())
//! # });
//! ```
//!
//! or resolved from a URI through the [factory], which picks the backend
//! provider deterministically and applies decorators from configuration
//! parameters:
//!
//! ```no_run
//! use tileverse_rangereader::config::ReaderConfig;
//! use tileverse_rangereader::factory;
//!
//! # tokio_test::block_on(async {
//! let config = ReaderConfig::new("s3://my-bucket/tiles.pmtiles")?
//!     .with_parameter(factory::params::MEMORY_CACHE_ENABLED, "true");
//! let reader = factory::open(&config).await?;
//! # Ok::<(), tileverse_rangereader::Error>(())
//! # });
//! ```

pub mod azure;
pub mod backoff;
pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod file;
pub mod gcs;
pub mod http;
pub mod provider;
pub mod range;
pub mod reader;
pub mod retry;
pub mod s3;
pub mod stream;

pub use error::{Error, ErrorKind, Result};
pub use range::ByteRange;
pub use reader::RangeReader;

/// Recovers the guard from a poisoned lock.
///
/// The locks in this crate guard small index or handle state that stays
/// consistent statement by statement, so a panic elsewhere does not leave
/// them half-updated.
pub(crate) fn unpoisoned<T>(result: std::result::Result<T, std::sync::PoisonError<T>>) -> T {
    result.unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Percent-encodes an object key for use as a URL path, preserving `/`.
pub(crate) fn encode_object_path(path: &str) -> String {
    use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
    const OBJECT_PATH: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'~')
        .remove(b'/');
    utf8_percent_encode(path, OBJECT_PATH).to_string()
}
