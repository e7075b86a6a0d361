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

//! A reader backed by an S3 or S3-compatible object store.

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

const DEFAULT_REGION: &str = "us-east-1";

/// Reads byte ranges from an S3 object via ranged `GET Object` requests.
///
/// The object must exist when the reader is built; construction issues a
/// `HEAD Object` request and records the object size. Throttling (`429`,
/// `503 SlowDown`) and transient transport failures are retried with
/// backoff.
///
/// Credentials are an opaque [HttpAuthentication] capability; a request
/// signer or token provider is supplied by the caller. S3-compatible stores
/// are reached with a custom endpoint and path-style addressing.
///
/// # Example
/// ```no_run
/// # use tileverse_rangereader::s3::S3RangeReader;
/// # use tileverse_rangereader::RangeReader;
/// # tokio_test::block_on(async {
/// let reader = S3RangeReader::builder("my-bucket", "tiles/planet.pmtiles")
///     .with_region("eu-central-1")
///     .connect()
///     .await?;
/// let bytes = reader.read_range(0, 16384).await?;
/// # Ok::<(), tileverse_rangereader::Error>(())
/// # });
/// ```
#[derive(Debug)]
pub struct S3RangeReader {
    http: HttpRangeReader,
    source_id: String,
    size: u64,
}

/// Builds [S3RangeReader] instances.
#[derive(Debug)]
pub struct S3RangeReaderBuilder {
    bucket: String,
    key: String,
    region: Option<String>,
    endpoint: Option<Url>,
    path_style: bool,
    auth: Arc<dyn HttpAuthentication>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    backoff_policy: Option<Arc<dyn BackoffPolicy>>,
}

impl S3RangeReaderBuilder {
    /// The AWS region hosting the bucket. Defaults to `$AWS_REGION`, then
    /// `us-east-1`.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// A custom endpoint for S3-compatible stores. Implies path-style
    /// addressing unless overridden.
    pub fn with_endpoint(mut self, endpoint: impl AsRef<str>) -> Result<Self> {
        self.endpoint = Some(Url::parse(endpoint.as_ref()).map_err(Error::configuration)?);
        self.path_style = true;
        Ok(self)
    }

    /// Address the bucket in the URL path instead of the host name.
    pub fn with_path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    /// Attach an authenticator (request signer, token provider) to every
    /// request.
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
        let key = encode_object_path(&self.key);
        let raw = match (&self.endpoint, self.path_style) {
            (Some(endpoint), _) => {
                let base = endpoint.as_str().trim_end_matches('/');
                format!("{base}/{}/{key}", self.bucket)
            }
            (None, true) => {
                format!("https://s3.{}.amazonaws.com/{}/{key}", self.effective_region(), self.bucket)
            }
            (None, false) => {
                format!("https://{}.s3.{}.amazonaws.com/{key}", self.bucket, self.effective_region())
            }
        };
        Url::parse(&raw).map_err(Error::configuration)
    }

    fn effective_region(&self) -> String {
        self.region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok())
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    /// Creates the reader, verifying that the object exists and recording its
    /// size.
    pub async fn connect(self) -> Result<S3RangeReader> {
        if self.bucket.is_empty() || self.key.is_empty() {
            return Err(Error::configuration(
                "an S3 reader requires both a bucket and an object key",
            ));
        }
        let source_id = format!("s3://{}/{}", self.bucket, self.key);
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
        Ok(S3RangeReader {
            http,
            source_id,
            size,
        })
    }
}

impl S3RangeReader {
    /// Starts building a reader for `bucket` and `key`.
    pub fn builder(bucket: impl Into<String>, key: impl Into<String>) -> S3RangeReaderBuilder {
        S3RangeReaderBuilder {
            bucket: bucket.into(),
            key: key.into(),
            region: None,
            endpoint: None,
            path_style: false,
            auth: Arc::new(NoAuthentication),
            retry_policy: None,
            backoff_policy: None,
        }
    }

    /// Starts building a reader from an `s3://bucket/key` URI.
    pub fn from_uri(uri: &Url) -> Result<S3RangeReaderBuilder> {
        if uri.scheme() != "s3" {
            return Err(Error::configuration(format!(
                "expected an s3:// URI, got {uri}"
            )));
        }
        let bucket = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::configuration(format!("{uri} is missing a bucket")))?;
        let key = uri.path().trim_start_matches('/');
        if key.is_empty() {
            return Err(Error::configuration(format!("{uri} is missing an object key")));
        }
        Ok(Self::builder(bucket, key))
    }
}

#[async_trait::async_trait]
impl RangeReader for S3RangeReader {
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
    fn from_uri_parses_bucket_and_key() -> TestResult {
        let uri = Url::parse("s3://my-bucket/deep/path/tiles.pmtiles")?;
        let builder = S3RangeReader::from_uri(&uri)?;
        assert_eq!(builder.bucket, "my-bucket");
        assert_eq!(builder.key, "deep/path/tiles.pmtiles");
        Ok(())
    }

    #[test]
    fn from_uri_rejects_bad_input() {
        for uri in ["https://example.com/x", "s3://bucket-only"] {
            let uri = Url::parse(uri).unwrap();
            let err = S3RangeReader::from_uri(&uri).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{uri}: {err:?}");
        }
    }

    #[test]
    fn virtual_host_url() -> TestResult {
        let url = S3RangeReader::builder("my-bucket", "a/b c.bin")
            .with_region("eu-central-1")
            .object_url()?;
        assert_eq!(
            url.as_str(),
            "https://my-bucket.s3.eu-central-1.amazonaws.com/a/b%20c.bin"
        );
        Ok(())
    }

    #[test]
    fn custom_endpoint_is_path_style() -> TestResult {
        let url = S3RangeReader::builder("my-bucket", "key.bin")
            .with_endpoint("http://localhost:9000")?
            .object_url()?;
        assert_eq!(url.as_str(), "http://localhost:9000/my-bucket/key.bin");
        Ok(())
    }

    #[tokio::test]
    async fn connect_records_size_and_reads() -> TestResult {
        let data: Vec<u8> = (0..4096_u32).map(|i| (i % 251) as u8).collect();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/my-bucket/key.bin"))
                .respond_with(
                    status_code(200)
                        .append_header("accept-ranges", "bytes")
                        .append_header("content-length", data.len().to_string()),
                ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/my-bucket/key.bin"),
                request::headers(contains(("range", "bytes=128-255"))),
            ])
            .respond_with(status_code(206).body(data[128..256].to_vec())),
        );

        let reader = S3RangeReader::builder("my-bucket", "key.bin")
            .with_endpoint(server.url_str("/"))?
            .connect()
            .await?;
        assert_eq!(reader.size().await?, Some(data.len() as u64));
        assert_eq!(reader.source_id(), "s3://my-bucket/key.bin");
        let got = reader.read_range(128, 128).await?;
        assert_eq!(&got[..], &data[128..256]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_object_fails_construction() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/my-bucket/absent.bin"))
                .respond_with(status_code(404)),
        );

        let err = S3RangeReader::builder("my-bucket", "absent.bin")
            .with_endpoint(server.url_str("/"))?
            .connect()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceNotFound, "{err:?}");
        Ok(())
    }
}
