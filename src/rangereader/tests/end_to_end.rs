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

//! End-to-end reads through composed pipelines, with the wire traffic
//! asserted by the test server. The server expectations count requests, so a
//! cache hit that leaked a request fails the test.

use httptest::matchers::{all_of, contains, request};
use httptest::responders::status_code;
use httptest::{Expectation, Server};
use std::sync::Arc;
use tileverse_rangereader::RangeReader;
use tileverse_rangereader::cache::disk::DiskCachingRangeReader;
use tileverse_rangereader::cache::memory::MemoryCachingRangeReader;
use tileverse_rangereader::file::FileRangeReader;
use tileverse_rangereader::http::HttpRangeReader;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn head_expectation(size: usize) -> Expectation {
    Expectation::matching(request::method_path("HEAD", "/data.bin")).respond_with(
        status_code(200)
            .append_header("accept-ranges", "bytes")
            .append_header("content-length", size.to_string()),
    )
}

#[tokio::test]
async fn local_file_exact_range() -> Result<()> {
    let data = pattern(100_000);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data.bin");
    std::fs::write(&path, &data)?;

    let reader = FileRangeReader::open(&path).await?;
    let got = reader.read_range(1000, 500).await?;
    assert_eq!(got.len(), 500);
    for (k, byte) in got.iter().enumerate() {
        assert_eq!(*byte, ((1000 + k) % 256) as u8, "at offset {}", 1000 + k);
    }
    Ok(())
}

#[tokio::test]
async fn local_file_eof_truncation_and_zero_length() -> Result<()> {
    let data = pattern(100_000);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data.bin");
    std::fs::write(&path, &data)?;

    let reader = FileRangeReader::open(&path).await?;
    let got = reader.read_range(99_900, 500).await?;
    assert_eq!(got.len(), 100);
    assert_eq!(&got[..], &data[99_900..]);

    let got = reader.read_range(100, 0).await?;
    assert_eq!(got.len(), 0);
    Ok(())
}

#[tokio::test]
async fn http_memory_cache_hit_issues_one_request() -> Result<()> {
    let data = pattern(100_000);
    let server = Server::run();
    server.expect(head_expectation(data.len()));
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/data.bin"),
            request::headers(contains(("range", "bytes=1000-1499"))),
        ])
        .times(1)
        .respond_with(status_code(206).body(data[1000..1500].to_vec())),
    );

    let http = HttpRangeReader::builder(server.url_str("/data.bin"))?.build()?;
    let reader = MemoryCachingRangeReader::builder(http)
        .with_max_entries(10)
        .build()
        .await?;

    let first = reader.read_range(1000, 500).await?;
    let second = reader.read_range(1000, 500).await?;
    assert_eq!(first, second);
    assert_eq!(&first[..], &data[1000..1500]);
    Ok(())
}

#[tokio::test]
async fn disk_cache_survives_external_deletion() -> Result<()> {
    let data = pattern(100_000);
    let server = Server::run();
    server.expect(head_expectation(data.len()));
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/data.bin"),
            request::headers(contains(("range", "bytes=2000-2299"))),
        ])
        .times(2)
        .respond_with(status_code(206).body(data[2000..2300].to_vec())),
    );

    let cache_dir = tempfile::tempdir()?;
    let http = HttpRangeReader::builder(server.url_str("/data.bin"))?.build()?;
    let reader = DiskCachingRangeReader::builder(http)
        .with_directory(cache_dir.path())
        .build()
        .await?;

    let first = reader.read_range(2000, 300).await?;
    assert_eq!(&first[..], &data[2000..2300]);

    // Exactly one cache file; delete it behind the reader's back.
    let cached: Vec<_> = std::fs::read_dir(cache_dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "bin"))
        .collect();
    assert_eq!(cached.len(), 1);
    let cache_file = cached[0].path();
    std::fs::remove_file(&cache_file)?;

    let second = reader.read_range(2000, 300).await?;
    assert_eq!(first, second);
    assert!(cache_file.exists(), "the cache file is recreated");

    // A third read is served from the recreated file; the `times(2)` bound
    // on the GET expectation catches any extra request.
    let third = reader.read_range(2000, 300).await?;
    assert_eq!(first, third);
    Ok(())
}

#[tokio::test]
async fn block_aligned_cache_fetches_each_block_once() -> Result<()> {
    let data = pattern(10_000);
    let server = Server::run();
    server.expect(head_expectation(data.len()));
    for start in [1024_usize, 2048, 3072, 4096] {
        let end = start + 1024;
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/data.bin"),
                request::headers(contains(("range", format!("bytes={start}-{}", end - 1)))),
            ])
            .times(1)
            .respond_with(status_code(206).body(data[start..end].to_vec())),
        );
    }

    let http = HttpRangeReader::builder(server.url_str("/data.bin"))?.build()?;
    let reader = MemoryCachingRangeReader::builder(http)
        .with_max_entries(100)
        .with_block_size(1024)
        .build()
        .await?;

    let got = reader.read_range(1500, 3000).await?;
    assert_eq!(&got[..], &data[1500..4500]);

    // Overlapping reads stay within the four cached blocks.
    let got = reader.read_range(2000, 2048).await?;
    assert_eq!(&got[..], &data[2000..4048]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_hit_each_range_once() -> Result<()> {
    let data = pattern(50_000);
    let ranges: &[(u64, u32)] = &[(0, 512), (512, 512), (1024, 512), (40_000, 256)];

    let server = Server::run();
    server.expect(head_expectation(data.len()));
    for (offset, length) in ranges {
        let from = *offset as usize;
        let to = from + *length as usize;
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/data.bin"),
                request::headers(contains((
                    "range",
                    format!("bytes={offset}-{}", offset + *length as u64 - 1)
                ))),
            ])
            .times(1)
            .respond_with(status_code(206).body(data[from..to].to_vec())),
        );
    }

    let http = HttpRangeReader::builder(server.url_str("/data.bin"))?.build()?;
    let reader = Arc::new(
        MemoryCachingRangeReader::builder(http)
            .with_max_weight_bytes(1 << 20)
            .build()
            .await?,
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let reader = reader.clone();
            let data = data.clone();
            tokio::spawn(async move {
                for (offset, length) in ranges {
                    let got = reader.read_range(*offset, *length).await.expect("read");
                    let from = *offset as usize;
                    assert_eq!(&got[..], &data[from..from + *length as usize]);
                }
            })
        })
        .collect();
    for task in tasks {
        task.await?;
    }
    Ok(())
}

#[tokio::test]
async fn memory_over_disk_composition() -> Result<()> {
    let data = pattern(100_000);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data.bin");
    std::fs::write(&path, &data)?;

    let file = FileRangeReader::open(&path).await?;
    let disk = DiskCachingRangeReader::builder(file)
        .with_directory(dir.path().join("cache"))
        .build()
        .await?;
    let reader = MemoryCachingRangeReader::builder(disk)
        .with_max_entries(100)
        .build()
        .await?;

    assert!(
        reader.source_id().starts_with("memory-cached:disk-cached:file://"),
        "{}",
        reader.source_id()
    );
    let first = reader.read_range(5000, 1000).await?;
    let second = reader.read_range(5000, 1000).await?;
    assert_eq!(first, second);
    assert_eq!(&first[..], &data[5000..6000]);

    reader.close().await?;
    reader.close().await?;
    Ok(())
}
