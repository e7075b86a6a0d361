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

//! A reader backed by a local random-access file.

use crate::error::Error;
use crate::reader::{RangeReader, checked_read};
use crate::{Result, unpoisoned};
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Reads byte ranges from a local file with positional reads.
///
/// The file size is taken once at construction; sources are assumed not to
/// change underneath a reader. The open handle is shared across concurrent
/// reads and released on [close][RangeReader::close].
///
/// # Example
/// ```no_run
/// # use tileverse_rangereader::file::FileRangeReader;
/// # use tileverse_rangereader::RangeReader;
/// # tokio_test::block_on(async {
/// let reader = FileRangeReader::open("tiles.pmtiles").await?;
/// let header = reader.read_range(0, 127).await?;
/// # Ok::<(), tileverse_rangereader::Error>(())
/// # });
/// ```
#[derive(Debug)]
pub struct FileRangeReader {
    path: PathBuf,
    source_id: String,
    size: u64,
    file: Mutex<Option<Arc<std::fs::File>>>,
}

impl FileRangeReader {
    /// Opens `path` for random access reads.
    ///
    /// Fails with [ErrorKind::SourceNotFound][crate::ErrorKind::SourceNotFound]
    /// if the path does not exist or is not a regular file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, size) = tokio::task::spawn_blocking({
            let path = path.clone();
            move || -> Result<(std::fs::File, u64)> {
                let file = std::fs::File::open(&path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::source_not_found(format!("{}: {e}", path.display()))
                    } else {
                        Error::io(e)
                    }
                })?;
                let metadata = file.metadata().map_err(Error::io)?;
                if !metadata.is_file() {
                    return Err(Error::source_not_found(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                Ok((file, metadata.len()))
            }
        })
        .await
        .map_err(Error::io)??;
        let source_id = match url::Url::from_file_path(&path) {
            Ok(url) => url.to_string(),
            Err(()) => format!("file://{}", path.display()),
        };
        Ok(Self {
            path,
            source_id,
            size,
            file: Mutex::new(Some(Arc::new(file))),
        })
    }

    /// The path this reader was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<Arc<std::fs::File>> {
        let guard = unpoisoned(self.file.lock());
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::io(format!("reader for {} is closed", self.path.display())))
    }
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[async_trait::async_trait]
impl RangeReader for FileRangeReader {
    async fn read_range_into(
        &self,
        offset: u64,
        length: u32,
        target: &mut BytesMut,
    ) -> Result<u32> {
        let file = self.handle()?;
        checked_read(Some(self.size), offset, length, target, async |offset, length| {
            tokio::task::spawn_blocking(move || -> Result<Bytes> {
                let mut buf = vec![0_u8; length as usize];
                let mut filled = 0_usize;
                while filled < buf.len() {
                    let n = read_at(&file, &mut buf[filled..], offset + filled as u64)
                        .map_err(Error::io)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(Bytes::from(buf))
            })
            .await
            .map_err(Error::io)?
        })
        .await
    }

    async fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.size))
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn close(&self) -> Result<()> {
        unpoisoned(self.file.lock()).take();
        Ok(())
    }
}
