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

//! A reader backed by Azure Blob Storage.

use crate::backoff::BackoffPolicy;
use crate::encode_object_path;
use crate::error::Error;
use crate::http::HttpRangeReader;
use crate::http::auth::{HttpAuthentication, NoAuthentication};
use crate::reader::{RangeReader, checked_read};
use crate::retry::RetryPolicy;
use crate::Result;
use bytes::BytesMut;
use http::HeaderMap;
use http::header::HeaderValue;
use std::sync::Arc;
use url::Url;

/// The service version pinned on every request.
const API_VERSION: &str = "2021-12-02";

/// Reads byte ranges from an Azure blob via ranged `Get Blob` requests.
///
/// The blob must exist when the reader is built; construction issues a
/// `Get Blob Properties` request and records the blob size. Requests pin
/// `x-ms-version` and may carry a SAS token in the query string, an opaque
/// [HttpAuthentication] capability, or both.
#[derive(Debug)]
pub struct AzureRangeReader {
    http: HttpRangeReader,
    source_id: String,
    size: u64,
}

/// Builds [AzureRangeReader] instances.
#[derive(Debug)]
pub struct AzureRangeReaderBuilder {
    account: String,
    container: String,
    blob: String,
    endpoint: Option<Url>,
    sas_token: Option<String>,
    auth: Arc<dyn HttpAuthentication>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    backoff_policy: Option<Arc<dyn BackoffPolicy>>,
}

impl AzureRangeReaderBuilder {
    /// A custom endpoint, for Azurite and sovereign clouds. Replaces the
    /// default `https://{account}.blob.core.windows.net`.
    pub fn with_endpoint(mut self, endpoint: impl AsRef<str>) -> Result<Self> {
        self.endpoint = Some(Url::parse(endpoint.as_ref()).map_err(Error::configuration)?);
        Ok(self)
    }

    /// A shared access signature appended to the blob URL query.
    pub fn with_sas_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.sas_token = Some(token.trim_start_matches('?').to_string());
        self
    }

    /// Attach an authenticator (SharedKey signer, bearer token provider) to
    /// every request.
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

    fn blob_url(&self) -> Result<Url> {
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.as_str().trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account),
        };
        let mut raw = format!(
            "{base}/{}/{}",
            self.container,
            encode_object_path(&self.blob)
        );
        if let Some(sas) = &self.sas_token {
            raw.push('?');
            raw.push_str(sas);
        }
        Url::parse(&raw).map_err(Error::configuration)
    }

    /// Creates the reader, verifying that the blob exists and recording its
    /// size.
    pub async fn connect(self) -> Result<AzureRangeReader> {
        if self.account.is_empty() && self.endpoint.is_none() {
            return Err(Error::configuration("an Azure reader requires an account"));
        }
        if self.container.is_empty() || self.blob.is_empty() {
            return Err(Error::configuration(
                "an Azure reader requires both a container and a blob name",
            ));
        }
        let url = self.blob_url()?;
        let mut source_id = url.clone();
        // The SAS token is a credential; keep it out of diagnostics.
        source_id.set_query(None);
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        let mut builder = HttpRangeReader::builder_for(url)?
            .with_shared_auth(self.auth)
            .with_default_headers(headers);
        if let Some(policy) = self.retry_policy {
            builder = builder.with_shared_retry_policy(policy);
        }
        if let Some(policy) = self.backoff_policy {
            builder = builder.with_shared_backoff_policy(policy);
        }
        let http = builder.build()?;
        let probe = http.head_probe().await?;
        let size = probe.content_length.ok_or_else(|| {
            Error::io(format!("{source_id}: the store did not report a blob size"))
        })?;
        Ok(AzureRangeReader {
            http,
            source_id: source_id.to_string(),
            size,
        })
    }
}

impl AzureRangeReader {
    /// Starts building a reader for the given account, container, and blob.
    pub fn builder(
        account: impl Into<String>,
        container: impl Into<String>,
        blob: impl Into<String>,
    ) -> AzureRangeReaderBuilder {
        AzureRangeReaderBuilder {
            account: account.into(),
            container: container.into(),
            blob: blob.into(),
            endpoint: None,
            sas_token: None,
            auth: Arc::new(NoAuthentication),
            retry_policy: None,
            backoff_policy: None,
        }
    }

    /// Starts building a reader from a
    /// `https://{account}.blob.core.windows.net/{container}/{blob}[?sas]` URL.
    pub fn from_uri(uri: &Url) -> Result<AzureRangeReaderBuilder> {
        let host = uri.host_str().unwrap_or_default();
        let account = host
            .strip_suffix(".blob.core.windows.net")
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                Error::configuration(format!("{uri} is not an Azure blob endpoint"))
            })?;
        let mut segments = uri.path().trim_start_matches('/').splitn(2, '/');
        let container = segments.next().unwrap_or_default();
        let blob = segments.next().unwrap_or_default();
        if container.is_empty() || blob.is_empty() {
            return Err(Error::configuration(format!(
                "{uri} is missing a container or blob name"
            )));
        }
        let mut builder = Self::builder(account, container, blob);
        if let Some(query) = uri.query() {
            builder = builder.with_sas_token(query);
        }
        Ok(builder)
    }
}

#[async_trait::async_trait]
impl RangeReader for AzureRangeReader {
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
