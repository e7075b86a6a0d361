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

//! A reader backed by Google Cloud Storage.

use crate::backoff::BackoffPolicy;
use crate::encode_object_path;
use crate::error::Error;
use crate::http::HttpRangeReader;
use crate::http::auth::{HttpAuthentication, NoAuthentication};
use crate::reader::{RangeReader, checked_read};
use crate::retry::RetryPolicy;
use crate::Result;
use bytes::BytesMut;
use std::sync::Arc;
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Reads byte ranges from a Google Cloud Storage object.
///
/// Uses the XML-compatible download endpoint with standard `Range` headers.
/// The object must exist when the reader is built; construction records the
/// object size. Credentials (typically a bearer token provider) are an
/// opaque [HttpAuthentication] capability.
#[derive(Debug)]
pub struct GcsRangeReader {
    http: HttpRangeReader,
    source_id: String,
    size: u64,
}

/// Builds [GcsRangeReader] instances.
#[derive(Debug)]
pub struct GcsRangeReaderBuilder {
    bucket: String,
    object: String,
    endpoint: Option<Url>,
    auth: Arc<dyn HttpAuthentication>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    backoff_policy: Option<Arc<dyn BackoffPolicy>>,
}

impl GcsRangeReaderBuilder {
    /// A custom endpoint, for the storage testbench and private routing.
    pub fn with_endpoint(mut self, endpoint: impl AsRef<str>) -> Result<Self> {
        self.endpoint = Some(Url::parse(endpoint.as_ref()).map_err(Error::configuration)?);
        Ok(self)
    }

    /// Attach an authenticator (bearer token provider) to every request.
    pub fn with_auth<A: HttpAuthentication + 'static>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// The retry policy for transient failures.
    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// The backoff policy between retry attempts.
    pub fn with_backoff_policy<P: BackoffPolicy + 'static>(mut self, policy: P) -> Self {
        self.backoff_policy = Some(Arc::new(policy));
        self
    }

    fn object_url(&self) -> Result<Url> {
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.as_str().trim_end_matches('/').to_string(),
            None => DEFAULT_ENDPOINT.to_string(),
        };
        let raw = format!(
            "{base}/{}/{}",
            self.bucket,
            encode_object_path(&self.object)
        );
        Url::parse(&raw).map_err(Error::configuration)
    }

    /// Creates the reader, verifying that the object exists and recording its
    /// size.
    pub async fn connect(self) -> Result<GcsRangeReader> {
        if self.bucket.is_empty() || self.object.is_empty() {
            return Err(Error::configuration(
                "a GCS reader requires both a bucket and an object name",
            ));
        }
        let source_id = format!("gs://{}/{}", self.bucket, self.object);
        let url = self.object_url()?;
        let mut builder = HttpRangeReader::builder_for(url)?.with_shared_auth(self.auth);
        if let Some(policy) = self.retry_policy {
            builder = builder.with_shared_retry_policy(policy);
        }
        if let Some(policy) = self.backoff_policy {
            builder = builder.with_shared_backoff_policy(policy);
        }
        let http = builder.build()?;
        let probe = http.head_probe().await?;
        let size = probe.content_length.ok_or_else(|| {
            Error::io(format!("{source_id}: the store did not report an object size"))
        })?;
        Ok(GcsRangeReader {
            http,
            source_id,
            size,
        })
    }
}

impl GcsRangeReader {
    /// Starts building a reader for `bucket` and `object`.
    pub fn builder(bucket: impl Into<String>, object: impl Into<String>) -> GcsRangeReaderBuilder {
        GcsRangeReaderBuilder {
            bucket: bucket.into(),
            object: object.into(),
            endpoint: None,
            auth: Arc::new(NoAuthentication),
            retry_policy: None,
            backoff_policy: None,
        }
    }

    /// Starts building a reader from a `gs://bucket/object` URI.
    pub fn from_uri(uri: &Url) -> Result<GcsRangeReaderBuilder> {
        if uri.scheme() != "gs" {
            return Err(Error::configuration(format!(
                "expected a gs:// URI, got {uri}"
            )));
        }
        let bucket = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::configuration(format!("{uri} is missing a bucket")))?;
        let object = uri.path().trim_start_matches('/');
        if object.is_empty() {
            return Err(Error::configuration(format!(
                "{uri} is missing an object name"
            )));
        }
        Ok(Self::builder(bucket, object))
    }
}

#[async_trait::async_trait]
impl RangeReader for GcsRangeReader {
    async fn read_range_into(
        &self,
        offset: u64,
        length: u32,
        target: &mut BytesMut,
    ) -> Result<u32> {
        checked_read(Some(self.size), offset, length, target, async |offset, length| {
            self.http.fetch_range(offset, length).await
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
        self.http.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use httptest::matchers::{all_of, contains, request};
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};

    type TestResult = anyhow::Result<()>;

    #[test]
    fn from_uri_parses_bucket_and_object() -> TestResult {
        let uri = Url::parse("gs://my-bucket/nested/tiles.pmtiles")?;
        let builder = GcsRangeReader::from_uri(&uri)?;
        assert_eq!(builder.bucket, "my-bucket");
        assert_eq!(builder.object, "nested/tiles.pmtiles");
        Ok(())
    }

    #[test]
    fn from_uri_rejects_bad_input() {
        for uri in ["s3://bucket/key", "gs://bucket-only"] {
            let uri = Url::parse(uri).unwrap();
            let err = GcsRangeReader::from_uri(&uri).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{uri}: {err:?}");
        }
    }

    #[test]
    fn object_url_uses_download_endpoint() -> TestResult {
        let url = GcsRangeReader::builder("my-bucket", "a/b c.bin").object_url()?;
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/my-bucket/a/b%20c.bin"
        );
        Ok(())
    }

    #[tokio::test]
    async fn connect_records_size_and_reads() -> TestResult {
        let data: Vec<u8> = (0..1024_u32).map(|i| (i % 241) as u8).collect();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/my-bucket/key.bin"))
                .respond_with(
                    status_code(200)
                        .append_header("accept-ranges", "bytes")
                        .append_header("content-length", data.len().to_string())
                        .append_header("x-goog-generation", "1736000000000000"),
                ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/my-bucket/key.bin"),
                request::headers(contains(("range", "bytes=0-63"))),
            ])
            .respond_with(status_code(206).body(data[0..64].to_vec())),
        );

        let reader = GcsRangeReader::builder("my-bucket", "key.bin")
            .with_endpoint(server.url_str("/"))?
            .connect()
            .await?;
        assert_eq!(reader.size().await?, Some(data.len() as u64));
        assert_eq!(reader.source_id(), "gs://my-bucket/key.bin");
        let got = reader.read_range(0, 64).await?;
        assert_eq!(&got[..], &data[0..64]);
        Ok(())
    }
}
