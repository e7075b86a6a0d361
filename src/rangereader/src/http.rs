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

//! A reader backed by an HTTP server with byte-range support.

pub mod auth;
pub mod digest;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::error::Error;
use crate::reader::{RangeReader, checked_read};
use crate::Result;
use crate::retry::{RetryPolicy, RetryPolicyExt as _, TransientErrors, retry_loop_on};
use auth::{ChallengeAction, HttpAuthentication, NoAuthentication};
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ATTEMPT_LIMIT: u32 = 4;

/// What the initial `HEAD` request revealed about the server.
#[derive(Clone, Debug)]
pub(crate) struct HeadProbe {
    pub accepts_ranges: bool,
    pub content_length: Option<u64>,
}

/// Reads byte ranges from an HTTP server via `Range: bytes=...` requests.
///
/// On first use the reader issues a `HEAD` request to learn the content
/// length and whether the server advertises `Accept-Ranges: bytes`. Range
/// reads accept `206 Partial Content` only: a server answering `200` (whole
/// body) or `416` to a ranged request does not honor byte ranges, and the
/// reader fails that and every later read with an unsupported-range error.
///
/// Transient failures (connection resets, timeouts, 408/429/5xx) are retried
/// with exponential backoff up to the configured attempt count.
///
/// # Example
/// ```no_run
/// # use tileverse_rangereader::http::HttpRangeReader;
/// # use tileverse_rangereader::http::auth::BasicAuthentication;
/// # use tileverse_rangereader::RangeReader;
/// # tokio_test::block_on(async {
/// let reader = HttpRangeReader::builder("https://example.com/tiles.pmtiles")?
///     .with_auth(BasicAuthentication::new("user", "secret")?)
///     .build()?;
/// let header = reader.read_range(0, 127).await?;
/// # Ok::<(), tileverse_rangereader::Error>(())
/// # });
/// ```
#[derive(Debug)]
pub struct HttpRangeReader {
    client: reqwest::Client,
    url: Url,
    auth: Arc<dyn HttpAuthentication>,
    source_id: String,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_policy: Arc<dyn BackoffPolicy>,
    attempt_timeout: Duration,
    probe: tokio::sync::OnceCell<HeadProbe>,
    ranges_unsupported: AtomicBool,
}

/// Builds [HttpRangeReader] instances.
#[derive(Debug)]
pub struct HttpRangeReaderBuilder {
    url: Url,
    auth: Arc<dyn HttpAuthentication>,
    connect_timeout: Duration,
    attempt_timeout: Duration,
    default_headers: HeaderMap,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    backoff_policy: Option<Arc<dyn BackoffPolicy>>,
}

impl HttpRangeReaderBuilder {
    fn new(url: Url) -> Self {
        Self {
            url,
            auth: Arc::new(NoAuthentication),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            default_headers: HeaderMap::new(),
            retry_policy: None,
            backoff_policy: None,
        }
    }

    /// Attach an authenticator to every outgoing request.
    pub fn with_auth<A: HttpAuthentication + 'static>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub(crate) fn with_shared_auth(mut self, auth: Arc<dyn HttpAuthentication>) -> Self {
        self.auth = auth;
        self
    }

    pub(crate) fn with_shared_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub(crate) fn with_shared_backoff_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff_policy = Some(policy);
        self
    }

    /// Change the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Change the per-attempt timeout for individual requests.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Headers attached to every request, before authentication runs.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
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

    /// Creates the reader, validating the configuration.
    pub fn build(self) -> Result<HttpRangeReader> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .default_headers(self.default_headers)
            .build()
            .map_err(Error::io)?;
        let source_id = self.url.to_string();
        Ok(HttpRangeReader {
            client,
            url: self.url,
            auth: self.auth,
            source_id,
            retry_policy: self.retry_policy.unwrap_or_else(|| {
                Arc::new(TransientErrors.with_attempt_limit(DEFAULT_ATTEMPT_LIMIT))
            }),
            backoff_policy: self
                .backoff_policy
                .unwrap_or_else(|| Arc::new(ExponentialBackoff::default())),
            attempt_timeout: self.attempt_timeout,
            probe: tokio::sync::OnceCell::new(),
            ranges_unsupported: AtomicBool::new(false),
        })
    }
}

impl HttpRangeReader {
    /// Starts building a reader for `url`.
    pub fn builder(url: impl AsRef<str>) -> Result<HttpRangeReaderBuilder> {
        let url = Url::parse(url.as_ref()).map_err(Error::configuration)?;
        Self::builder_for(url)
    }

    pub(crate) fn builder_for(url: Url) -> Result<HttpRangeReaderBuilder> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::configuration(format!(
                "expected an http:// or https:// URL, got {url}"
            )));
        }
        Ok(HttpRangeReaderBuilder::new(url))
    }

    /// The URL this reader fetches from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the probe saw `Accept-Ranges: bytes`.
    ///
    /// Servers may honor ranges without advertising them, so `false` does
    /// not fail reads; the first ranged `GET` decides. A `200` or `416`
    /// answer to one is what poisons the reader.
    pub async fn advertises_byte_ranges(&self) -> Result<bool> {
        Ok(self.head_probe().await?.accepts_ranges)
    }

    pub(crate) async fn head_probe(&self) -> Result<&HeadProbe> {
        self.probe
            .get_or_try_init(|| async {
                let retry = self.retry_policy.clone();
                let backoff = self.backoff_policy.clone();
                retry_loop_on(
                    self,
                    |this: &Self, remaining| Box::pin(this.head_attempt(remaining)),
                    async |d| tokio::time::sleep(d).await,
                    true,
                    retry,
                    backoff,
                )
                .await
            })
            .await
    }

    async fn head_attempt(&self, remaining: Option<Duration>) -> Result<HeadProbe> {
        let response = self.attempt(Method::HEAD, None, remaining).await?;
        let status = response.status();
        if status.is_success() {
            let accepts_ranges = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
            let content_length = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Ok(HeadProbe {
                accepts_ranges,
                content_length,
            });
        }
        match status {
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                // No HEAD support: size stays unknown, the first GET decides
                // whether ranges work.
                Ok(HeadProbe {
                    accepts_ranges: false,
                    content_length: None,
                })
            }
            _ => Err(Error::http(status.as_u16())),
        }
    }

    pub(crate) async fn fetch_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        if self.ranges_unsupported.load(Ordering::Acquire) {
            return Err(Error::unsupported_range(format!(
                "{} does not honor byte ranges",
                self.url
            )));
        }
        let retry = self.retry_policy.clone();
        let backoff = self.backoff_policy.clone();
        retry_loop_on(
            self,
            move |this: &Self, remaining| Box::pin(this.range_attempt(offset, length, remaining)),
            async |d| tokio::time::sleep(d).await,
            true,
            retry,
            backoff,
        )
        .await
    }

    async fn range_attempt(
        &self,
        offset: u64,
        length: u32,
        remaining: Option<Duration>,
    ) -> Result<Bytes> {
        let response = self.attempt(Method::GET, Some((offset, length)), remaining).await?;
        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => response.bytes().await.map_err(Error::io),
            StatusCode::OK | StatusCode::RANGE_NOT_SATISFIABLE => {
                self.ranges_unsupported.store(true, Ordering::Release);
                Err(Error::unsupported_range(format!(
                    "{} answered {status} to a ranged request",
                    self.url
                )))
            }
            _ => Err(Error::http(status.as_u16())),
        }
    }

    /// One request attempt, with authentication and at most one immediate
    /// re-issue after an absorbed `401` challenge.
    async fn attempt(
        &self,
        method: Method,
        range: Option<(u64, u32)>,
        remaining: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let timeout = match remaining {
            Some(remaining) => std::cmp::min(self.attempt_timeout, remaining),
            None => self.attempt_timeout,
        };
        let mut challenged = false;
        loop {
            let mut request = reqwest::Request::new(method.clone(), self.url.clone());
            *request.timeout_mut() = Some(timeout);
            if let Some((offset, length)) = range {
                let value = format!("bytes={offset}-{}", offset + length as u64 - 1);
                request.headers_mut().insert(
                    RANGE,
                    http::HeaderValue::from_str(&value).map_err(Error::invalid_argument)?,
                );
            }
            self.auth.apply(&mut request)?;
            let response = self.client.execute(request).await.map_err(Error::io)?;
            if response.status() == StatusCode::UNAUTHORIZED {
                if !challenged
                    && self.auth.on_unauthorized(response.headers()) == ChallengeAction::Retry
                {
                    challenged = true;
                    continue;
                }
                return Err(Error::authentication(format!(
                    "{} rejected the configured credentials",
                    self.url
                )));
            }
            if response.status() == StatusCode::FORBIDDEN {
                return Err(Error::authentication(format!(
                    "access to {} is forbidden",
                    self.url
                )));
            }
            if response.status() == StatusCode::NOT_FOUND {
                return Err(Error::source_not_found(self.url.to_string()));
            }
            return Ok(response);
        }
    }
}

#[async_trait::async_trait]
impl RangeReader for HttpRangeReader {
    async fn read_range_into(
        &self,
        offset: u64,
        length: u32,
        target: &mut BytesMut,
    ) -> Result<u32> {
        if length == 0 {
            // Not even the size probe: zero-length reads do no I/O.
            return Ok(0);
        }
        let size = self.size().await?;
        checked_read(size, offset, length, target, async |offset, length| {
            self.fetch_range(offset, length).await
        })
        .await
    }

    async fn size(&self) -> Result<Option<u64>> {
        Ok(self.head_probe().await?.content_length)
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}
