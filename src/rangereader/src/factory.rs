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

//! Provider discovery, reader selection, and decorator composition.
//!
//! [open] resolves a [ReaderConfig] to a backend reader and wraps it in the
//! configured caches. Selection is deterministic:
//!
//! 1. An explicit provider id wins; unknown or disabled ids fail.
//! 2. Otherwise every enabled provider whose `can_process` accepts the
//!    config is a candidate. No candidate fails; one candidate wins.
//! 3. Several candidates on a non-HTTP scheme resolve by priority (lowest
//!    `order`); a tie for the lowest order is an error naming the tied ids.
//! 4. Several candidates on `http`/`https` are disambiguated with a
//!    best-effort `HEAD` probe (3 s timeout): the generic HTTP provider is
//!    set aside, the remaining cloud candidates filter on the response
//!    headers. Exactly one match wins; no match falls back to generic HTTP;
//!    several matches resolve by priority. Only a network failure skips the
//!    probe and resolves every candidate by priority.
//!
//! Decorators come from configuration parameters and are always stacked with
//! aligners above the caches they align: caller → memory cache (block-aware)
//! → aligner → disk cache → backend.

use crate::azure::AzureRangeReader;
use crate::block::BlockAlignedRangeReader;
use crate::cache::disk::DiskCachingRangeReader;
use crate::cache::memory::MemoryCachingRangeReader;
use crate::config::ReaderConfig;
use crate::error::Error;
use crate::file::FileRangeReader;
use crate::gcs::GcsRangeReader;
use crate::http::HttpRangeReader;
use crate::http::auth::{
    ApiKeyAuthentication, BasicAuthentication, BearerAuthentication, HttpAuthentication,
};
use crate::http::digest::DigestAuthentication;
use crate::provider::{ParameterType, ProviderParameter, ReaderProvider, provider_enabled};
use crate::reader::RangeReader;
use crate::{Result, unpoisoned};
use http::HeaderMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use url::Url;

const HEAD_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The parameter keys recognized by the bundled providers and decorators.
pub mod params {
    // HTTP
    pub const HTTP_USERNAME: &str = "io.tileverse.rangereader.http.username";
    pub const HTTP_PASSWORD: &str = "io.tileverse.rangereader.http.password";
    pub const HTTP_AUTH_METHOD: &str = "io.tileverse.rangereader.http.auth-method";
    pub const HTTP_BEARER_TOKEN: &str = "io.tileverse.rangereader.http.bearer-token";
    pub const HTTP_API_KEY_HEADER: &str = "io.tileverse.rangereader.http.api-key-header";
    pub const HTTP_API_KEY: &str = "io.tileverse.rangereader.http.api-key";
    pub const HTTP_CONNECT_TIMEOUT_MILLIS: &str =
        "io.tileverse.rangereader.http.connect-timeout-millis";
    pub const HTTP_ATTEMPT_TIMEOUT_MILLIS: &str =
        "io.tileverse.rangereader.http.attempt-timeout-millis";
    // S3
    pub const S3_REGION: &str = "io.tileverse.rangereader.s3.region";
    pub const S3_ENDPOINT: &str = "io.tileverse.rangereader.s3.endpoint";
    pub const S3_PATH_STYLE: &str = "io.tileverse.rangereader.s3.path-style";
    // Azure
    pub const AZURE_ACCOUNT: &str = "io.tileverse.rangereader.azure.account";
    pub const AZURE_CONTAINER: &str = "io.tileverse.rangereader.azure.container";
    pub const AZURE_BLOB_NAME: &str = "io.tileverse.rangereader.azure.blob-name";
    pub const AZURE_SAS_TOKEN: &str = "io.tileverse.rangereader.azure.sas-token";
    pub const AZURE_ENDPOINT: &str = "io.tileverse.rangereader.azure.endpoint";
    pub const AZURE_BEARER_TOKEN: &str = "io.tileverse.rangereader.azure.bearer-token";
    // GCS
    pub const GCS_ENDPOINT: &str = "io.tileverse.rangereader.gcs.endpoint";
    pub const GCS_BEARER_TOKEN: &str = "io.tileverse.rangereader.gcs.bearer-token";
    // Memory cache decorator
    pub const MEMORY_CACHE_ENABLED: &str = "io.tileverse.rangereader.memory-cache.enabled";
    pub const MEMORY_CACHE_MAX_ENTRIES: &str = "io.tileverse.rangereader.memory-cache.max-entries";
    pub const MEMORY_CACHE_MAX_SIZE_BYTES: &str =
        "io.tileverse.rangereader.memory-cache.max-size-bytes";
    pub const MEMORY_CACHE_EXPIRE_AFTER_ACCESS_MILLIS: &str =
        "io.tileverse.rangereader.memory-cache.expire-after-access-millis";
    pub const MEMORY_CACHE_BLOCK_SIZE: &str = "io.tileverse.rangereader.memory-cache.block-size";
    pub const MEMORY_CACHE_HEADER_SIZE: &str = "io.tileverse.rangereader.memory-cache.header-size";
    // Disk cache decorator
    pub const DISK_CACHE_ENABLED: &str = "io.tileverse.rangereader.disk-cache.enabled";
    pub const DISK_CACHE_DIRECTORY: &str = "io.tileverse.rangereader.disk-cache.directory";
    pub const DISK_CACHE_MAX_SIZE_BYTES: &str =
        "io.tileverse.rangereader.disk-cache.max-size-bytes";
    pub const DISK_CACHE_DELETE_ON_CLOSE: &str =
        "io.tileverse.rangereader.disk-cache.delete-on-close";
    pub const DISK_CACHE_BLOCK_SIZE: &str = "io.tileverse.rangereader.disk-cache.block-size";
}

/// The process-wide registry of reader providers.
///
/// Initialized with the bundled providers; additional providers register at
/// startup. Availability (the `IO_TILEVERSE_RANGEREADER_{ID}` environment
/// guard) is evaluated on every query, not at registration.
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Mutex<Vec<Arc<dyn ReaderProvider>>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
        }
    }

    /// A registry holding the bundled file, HTTP, S3, GCS, and Azure
    /// providers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(FileProvider));
        registry.register(Arc::new(S3Provider));
        registry.register(Arc::new(GcsProvider));
        registry.register(Arc::new(AzureProvider));
        registry.register(Arc::new(HttpProvider));
        registry
    }

    /// Adds a provider.
    pub fn register(&self, provider: Arc<dyn ReaderProvider>) {
        unpoisoned(self.providers.lock()).push(provider);
    }

    /// The providers that are currently enabled.
    pub fn available(&self) -> Vec<Arc<dyn ReaderProvider>> {
        unpoisoned(self.providers.lock())
            .iter()
            .filter(|p| provider_enabled(p.id()))
            .cloned()
            .collect()
    }

    fn find(&self, id: &str) -> Option<Arc<dyn ReaderProvider>> {
        unpoisoned(self.providers.lock())
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// Picks the provider for `config` per the selection rules.
    pub async fn select(&self, config: &ReaderConfig) -> Result<Arc<dyn ReaderProvider>> {
        if let Some(id) = config.provider_id() {
            let provider = self.find(id).ok_or_else(|| {
                Error::configuration(format!("unknown provider {id:?} requested"))
            })?;
            if !provider_enabled(id) {
                return Err(Error::configuration(format!(
                    "provider {id:?} is disabled by its environment guard"
                )));
            }
            return Ok(provider);
        }
        let candidates: Vec<_> = self
            .available()
            .into_iter()
            .filter(|p| p.can_process(config))
            .collect();
        match candidates.len() {
            0 => Err(Error::configuration(format!(
                "no suitable provider for {}",
                config.uri()
            ))),
            1 => Ok(candidates.into_iter().next().expect("one candidate")),
            _ if !matches!(config.scheme(), "http" | "https") => resolve_by_priority(candidates),
            _ => self.disambiguate_http(config, candidates).await,
        }
    }

    async fn disambiguate_http(
        &self,
        config: &ReaderConfig,
        candidates: Vec<Arc<dyn ReaderProvider>>,
    ) -> Result<Arc<dyn ReaderProvider>> {
        let generic = candidates.iter().find(|p| p.id() == "http").cloned();
        let cloud: Vec<_> = candidates
            .iter()
            .filter(|p| p.id() != "http")
            .cloned()
            .collect();
        let Some(headers) = head_probe(config.uri()).await else {
            // Network failure: fall back to pure priority resolution.
            return resolve_by_priority(candidates);
        };
        let matching: Vec<_> = cloud
            .into_iter()
            .filter(|p| p.can_process_headers(config.uri(), &headers))
            .collect();
        tracing::debug!(
            uri = %config.uri(),
            matching = ?matching.iter().map(|p| p.id()).collect::<Vec<_>>(),
            "HEAD probe disambiguation"
        );
        match matching.len() {
            1 => Ok(matching.into_iter().next().expect("one match")),
            0 => generic.ok_or_else(|| {
                Error::configuration(format!("no suitable provider for {}", config.uri()))
            }),
            _ => resolve_by_priority(matching),
        }
    }

    /// Builds the backend reader for `config` and applies the configured
    /// decorators.
    pub async fn open(&self, config: &ReaderConfig) -> Result<Arc<dyn RangeReader>> {
        let provider = self.select(config).await?;
        log_unrecognized_parameters(&*provider, config);
        tracing::debug!(uri = %config.uri(), provider = provider.id(), "selected provider");
        let reader = provider.create(config).await?;
        apply_decorators(Arc::from(reader), config).await
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

static REGISTRY: LazyLock<ProviderRegistry> = LazyLock::new(ProviderRegistry::with_defaults);

/// The process-wide registry, initialized with the bundled providers.
pub fn registry() -> &'static ProviderRegistry {
    &REGISTRY
}

/// Opens a reader for `config` using the process-wide registry.
///
/// # Example
/// ```no_run
/// # use tileverse_rangereader::config::ReaderConfig;
/// # use tileverse_rangereader::factory;
/// # tokio_test::block_on(async {
/// let config = ReaderConfig::new("s3://my-bucket/tiles.pmtiles")?
///     .with_parameter(factory::params::MEMORY_CACHE_ENABLED, "true")
///     .with_parameter(factory::params::MEMORY_CACHE_BLOCK_SIZE, "65536");
/// let reader = factory::open(&config).await?;
/// let header = reader.read_range(0, 127).await?;
/// # Ok::<(), tileverse_rangereader::Error>(())
/// # });
/// ```
pub async fn open(config: &ReaderConfig) -> Result<Arc<dyn RangeReader>> {
    registry().open(config).await
}

fn resolve_by_priority(candidates: Vec<Arc<dyn ReaderProvider>>) -> Result<Arc<dyn ReaderProvider>> {
    let best = candidates
        .iter()
        .map(|p| p.order())
        .min()
        .ok_or_else(|| Error::configuration("no candidate providers"))?;
    let mut tied: Vec<_> = candidates
        .into_iter()
        .filter(|p| p.order() == best)
        .collect();
    if tied.len() > 1 {
        let ids: Vec<_> = tied.iter().map(|p| p.id()).collect();
        return Err(Error::configuration(format!(
            "providers {ids:?} tie at order {best}; set an explicit provider id"
        )));
    }
    tied.pop()
        .ok_or_else(|| Error::configuration("no candidate providers"))
}

/// Issues the disambiguation `HEAD`. Any response, whatever its status,
/// yields headers; only a network failure yields `None`.
async fn head_probe(uri: &Url) -> Option<HeaderMap> {
    let client = reqwest::Client::builder()
        .timeout(HEAD_PROBE_TIMEOUT)
        .build()
        .ok()?;
    match client.head(uri.clone()).send().await {
        Ok(response) => Some(response.headers().clone()),
        Err(e) => {
            tracing::debug!(uri = %uri, error = %e, "HEAD probe failed");
            None
        }
    }
}

fn log_unrecognized_parameters(provider: &dyn ReaderProvider, config: &ReaderConfig) {
    let recognized: Vec<String> = provider
        .parameters()
        .into_iter()
        .map(|p| p.key)
        .chain(decorator_parameters().into_iter().map(|p| p.key))
        .collect();
    for key in config.parameter_keys() {
        if !recognized.iter().any(|k| k == key) {
            tracing::debug!(parameter = key, provider = provider.id(), "ignoring parameter");
        }
    }
}

/// The parameters of the caching decorators, which apply to every provider.
pub fn decorator_parameters() -> Vec<ProviderParameter> {
    vec![
        ProviderParameter::new(
            params::MEMORY_CACHE_ENABLED,
            "Memory cache",
            "Cache slices in memory.",
            "Caching",
            ParameterType::Boolean,
        )
        .with_default("false"),
        ProviderParameter::new(
            params::MEMORY_CACHE_MAX_ENTRIES,
            "Memory cache entries",
            "Bound the memory cache by entry count.",
            "Caching",
            ParameterType::Integer,
        ),
        ProviderParameter::new(
            params::MEMORY_CACHE_MAX_SIZE_BYTES,
            "Memory cache size",
            "Bound the memory cache by buffer bytes.",
            "Caching",
            ParameterType::Integer,
        ),
        ProviderParameter::new(
            params::MEMORY_CACHE_EXPIRE_AFTER_ACCESS_MILLIS,
            "Memory cache expiry",
            "Drop entries unread for this long.",
            "Caching",
            ParameterType::Duration,
        ),
        ProviderParameter::new(
            params::MEMORY_CACHE_BLOCK_SIZE,
            "Memory cache block size",
            "Align memory-cache loads to blocks of this many bytes.",
            "Caching",
            ParameterType::Integer,
        )
        .with_samples(["65536", "1048576"]),
        ProviderParameter::new(
            params::MEMORY_CACHE_HEADER_SIZE,
            "Header prefetch",
            "Eagerly load this many leading bytes at construction.",
            "Caching",
            ParameterType::Integer,
        ),
        ProviderParameter::new(
            params::DISK_CACHE_ENABLED,
            "Disk cache",
            "Persist slices as files.",
            "Caching",
            ParameterType::Boolean,
        )
        .with_default("false"),
        ProviderParameter::new(
            params::DISK_CACHE_DIRECTORY,
            "Disk cache directory",
            "Where the cache files live.",
            "Caching",
            ParameterType::Path,
        ),
        ProviderParameter::new(
            params::DISK_CACHE_MAX_SIZE_BYTES,
            "Disk cache size",
            "Bound the summed cache file sizes.",
            "Caching",
            ParameterType::Integer,
        )
        .with_default("1073741824"),
        ProviderParameter::new(
            params::DISK_CACHE_DELETE_ON_CLOSE,
            "Delete on close",
            "Delete this reader's cache files when it closes.",
            "Caching",
            ParameterType::Boolean,
        )
        .with_default("false"),
        ProviderParameter::new(
            params::DISK_CACHE_BLOCK_SIZE,
            "Disk cache block size",
            "Align disk-cache loads to blocks of this many bytes.",
            "Caching",
            ParameterType::Integer,
        ),
    ]
}

/// Wraps `reader` in the decorators the configuration asks for, aligners
/// above the caches they align.
async fn apply_decorators(
    reader: Arc<dyn RangeReader>,
    config: &ReaderConfig,
) -> Result<Arc<dyn RangeReader>> {
    let mut reader = reader;
    if config.bool_parameter(params::DISK_CACHE_ENABLED)? == Some(true) {
        let mut builder = DiskCachingRangeReader::builder_shared(reader);
        if let Some(directory) = config.path_parameter(params::DISK_CACHE_DIRECTORY) {
            builder = builder.with_directory(directory);
        }
        if let Some(max) = config.u64_parameter(params::DISK_CACHE_MAX_SIZE_BYTES)? {
            builder = builder.with_max_size_bytes(max);
        }
        if let Some(delete) = config.bool_parameter(params::DISK_CACHE_DELETE_ON_CLOSE)? {
            builder = builder.with_delete_on_close(delete);
        }
        reader = Arc::new(builder.build().await?);
        if let Some(block_size) = config.u32_parameter(params::DISK_CACHE_BLOCK_SIZE)? {
            reader = Arc::new(BlockAlignedRangeReader::new_shared(reader, block_size)?);
        }
    }
    if config.bool_parameter(params::MEMORY_CACHE_ENABLED)? == Some(true) {
        let mut builder = MemoryCachingRangeReader::builder_shared(reader);
        if let Some(entries) = config.u64_parameter(params::MEMORY_CACHE_MAX_ENTRIES)? {
            builder = builder.with_max_entries(entries);
        }
        if let Some(weight) = config.u64_parameter(params::MEMORY_CACHE_MAX_SIZE_BYTES)? {
            builder = builder.with_max_weight_bytes(weight);
        }
        if let Some(expiry) =
            config.duration_parameter(params::MEMORY_CACHE_EXPIRE_AFTER_ACCESS_MILLIS)?
        {
            builder = builder.with_expire_after_access(expiry);
        }
        if let Some(block_size) = config.u32_parameter(params::MEMORY_CACHE_BLOCK_SIZE)? {
            builder = builder.with_block_size(block_size);
        }
        if let Some(header) = config.u32_parameter(params::MEMORY_CACHE_HEADER_SIZE)? {
            builder = builder.with_header_size(header);
        }
        reader = Arc::new(builder.build().await?);
    }
    Ok(reader)
}

/// Serves `file://` URIs from the local filesystem.
#[derive(Debug)]
struct FileProvider;

#[async_trait::async_trait]
impl ReaderProvider for FileProvider {
    fn id(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Local files"
    }

    fn order(&self) -> i32 {
        0
    }

    fn parameters(&self) -> Vec<ProviderParameter> {
        Vec::new()
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        config.scheme() == "file"
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>> {
        let path = config.uri().to_file_path().map_err(|()| {
            Error::configuration(format!("{} is not a local file path", config.uri()))
        })?;
        Ok(Box::new(FileRangeReader::open(path).await?))
    }
}

/// Serves `http://` and `https://` URIs from any range-capable server.
#[derive(Debug)]
struct HttpProvider;

fn http_auth_from(config: &ReaderConfig) -> Result<Option<Arc<dyn HttpAuthentication>>> {
    if let Some(token) = config.parameter(params::HTTP_BEARER_TOKEN) {
        return Ok(Some(Arc::new(BearerAuthentication::new(token)?)));
    }
    if let (Some(header), Some(key)) = (
        config.parameter(params::HTTP_API_KEY_HEADER),
        config.parameter(params::HTTP_API_KEY),
    ) {
        return Ok(Some(Arc::new(ApiKeyAuthentication::new(header, key)?)));
    }
    if let (Some(username), Some(password)) = (
        config.parameter(params::HTTP_USERNAME),
        config.parameter(params::HTTP_PASSWORD),
    ) {
        return match config.parameter(params::HTTP_AUTH_METHOD) {
            Some("digest") => Ok(Some(Arc::new(DigestAuthentication::new(username, password)))),
            Some("basic") | None => Ok(Some(Arc::new(BasicAuthentication::new(
                username, password,
            )?))),
            Some(other) => Err(Error::configuration(format!(
                "{}: expected basic or digest, got {other:?}",
                params::HTTP_AUTH_METHOD
            ))),
        };
    }
    Ok(None)
}

#[async_trait::async_trait]
impl ReaderProvider for HttpProvider {
    fn id(&self) -> &'static str {
        "http"
    }

    fn description(&self) -> &'static str {
        "HTTP servers with byte-range support"
    }

    fn order(&self) -> i32 {
        100
    }

    fn parameters(&self) -> Vec<ProviderParameter> {
        vec![
            ProviderParameter::new(
                params::HTTP_USERNAME,
                "Username",
                "Username for basic or digest authentication.",
                "HTTP",
                ParameterType::String,
            )
            .with_subgroup("Authentication"),
            ProviderParameter::new(
                params::HTTP_PASSWORD,
                "Password",
                "Password for basic or digest authentication.",
                "HTTP",
                ParameterType::String,
            )
            .with_subgroup("Authentication"),
            ProviderParameter::new(
                params::HTTP_AUTH_METHOD,
                "Method",
                "How username and password are presented.",
                "HTTP",
                ParameterType::String,
            )
            .with_subgroup("Authentication")
            .with_default("basic")
            .with_samples(["basic", "digest"]),
            ProviderParameter::new(
                params::HTTP_BEARER_TOKEN,
                "Bearer token",
                "Token for the Authorization: Bearer header.",
                "HTTP",
                ParameterType::String,
            )
            .with_subgroup("Authentication"),
            ProviderParameter::new(
                params::HTTP_API_KEY_HEADER,
                "API key header",
                "Header name carrying the API key.",
                "HTTP",
                ParameterType::String,
            )
            .with_subgroup("Authentication")
            .with_samples(["x-api-key"]),
            ProviderParameter::new(
                params::HTTP_API_KEY,
                "API key",
                "The API key value.",
                "HTTP",
                ParameterType::String,
            )
            .with_subgroup("Authentication"),
            ProviderParameter::new(
                params::HTTP_CONNECT_TIMEOUT_MILLIS,
                "Connect timeout",
                "Connection establishment timeout.",
                "HTTP",
                ParameterType::Duration,
            )
            .with_default("5000"),
            ProviderParameter::new(
                params::HTTP_ATTEMPT_TIMEOUT_MILLIS,
                "Attempt timeout",
                "Per-request timeout.",
                "HTTP",
                ParameterType::Duration,
            )
            .with_default("30000"),
        ]
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        matches!(config.scheme(), "http" | "https")
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>> {
        let mut builder = HttpRangeReader::builder_for(config.uri().clone())?;
        if let Some(auth) = http_auth_from(config)? {
            builder = builder.with_shared_auth(auth);
        }
        if let Some(timeout) = config.duration_parameter(params::HTTP_CONNECT_TIMEOUT_MILLIS)? {
            builder = builder.with_connect_timeout(timeout);
        }
        if let Some(timeout) = config.duration_parameter(params::HTTP_ATTEMPT_TIMEOUT_MILLIS)? {
            builder = builder.with_attempt_timeout(timeout);
        }
        Ok(Box::new(builder.build()?))
    }
}

/// Serves `s3://` URIs and amazonaws.com URLs.
#[derive(Debug)]
struct S3Provider;

fn is_s3_host(host: &str) -> bool {
    host.ends_with(".amazonaws.com") && (host.starts_with("s3.") || host.contains(".s3."))
}

/// Decomposes a virtual-host or path-style amazonaws.com URL.
fn parse_s3_https(uri: &Url) -> Result<(String, String, Option<String>)> {
    let host = uri
        .host_str()
        .ok_or_else(|| Error::configuration(format!("{uri} has no host")))?;
    let key_path = uri.path().trim_start_matches('/');
    if host.starts_with("s3.") {
        // Path style: s3.{region}.amazonaws.com/{bucket}/{key}.
        let region = host
            .trim_start_matches("s3.")
            .trim_end_matches(".amazonaws.com");
        let (bucket, key) = key_path.split_once('/').ok_or_else(|| {
            Error::configuration(format!("{uri} is missing a bucket or object key"))
        })?;
        let region = (!region.is_empty()).then(|| region.to_string());
        return Ok((bucket.to_string(), key.to_string(), region));
    }
    // Virtual host: {bucket}.s3.{region}.amazonaws.com/{key}.
    let (bucket, rest) = host
        .split_once(".s3.")
        .ok_or_else(|| Error::configuration(format!("{uri} is not an S3 URL")))?;
    let region = rest.trim_end_matches(".amazonaws.com");
    if key_path.is_empty() {
        return Err(Error::configuration(format!("{uri} is missing an object key")));
    }
    let region = (region != "amazonaws.com" && !region.is_empty()).then(|| region.to_string());
    Ok((bucket.to_string(), key_path.to_string(), region))
}

#[async_trait::async_trait]
impl ReaderProvider for S3Provider {
    fn id(&self) -> &'static str {
        "s3"
    }

    fn description(&self) -> &'static str {
        "Amazon S3 and S3-compatible object stores"
    }

    fn order(&self) -> i32 {
        10
    }

    fn parameters(&self) -> Vec<ProviderParameter> {
        vec![
            ProviderParameter::new(
                params::S3_REGION,
                "Region",
                "The AWS region hosting the bucket.",
                "S3",
                ParameterType::String,
            )
            .with_default("us-east-1")
            .with_samples(["eu-central-1", "us-west-2"]),
            ProviderParameter::new(
                params::S3_ENDPOINT,
                "Endpoint",
                "Custom endpoint for S3-compatible stores.",
                "S3",
                ParameterType::String,
            )
            .with_samples(["http://localhost:9000"]),
            ProviderParameter::new(
                params::S3_PATH_STYLE,
                "Path-style addressing",
                "Address the bucket in the URL path instead of the host.",
                "S3",
                ParameterType::Boolean,
            )
            .with_default("false"),
        ]
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        match config.scheme() {
            "s3" => true,
            "http" | "https" => config
                .uri()
                .host_str()
                .is_some_and(is_s3_host),
            _ => false,
        }
    }

    fn can_process_headers(&self, _uri: &Url, headers: &HeaderMap) -> bool {
        headers.contains_key("x-amz-request-id")
            || headers
                .get(http::header::SERVER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("AmazonS3"))
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>> {
        let mut builder = match config.scheme() {
            "s3" => crate::s3::S3RangeReader::from_uri(config.uri())?,
            _ => {
                let (bucket, key, region) = parse_s3_https(config.uri())?;
                let mut builder = crate::s3::S3RangeReader::builder(bucket, key);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                builder
            }
        };
        if let Some(region) = config.parameter(params::S3_REGION) {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = config.parameter(params::S3_ENDPOINT) {
            builder = builder.with_endpoint(endpoint)?;
        }
        if let Some(path_style) = config.bool_parameter(params::S3_PATH_STYLE)? {
            builder = builder.with_path_style(path_style);
        }
        Ok(Box::new(builder.connect().await?))
    }
}

/// Serves `gs://` URIs and storage.googleapis.com URLs.
#[derive(Debug)]
struct GcsProvider;

#[async_trait::async_trait]
impl ReaderProvider for GcsProvider {
    fn id(&self) -> &'static str {
        "gcs"
    }

    fn description(&self) -> &'static str {
        "Google Cloud Storage"
    }

    fn order(&self) -> i32 {
        20
    }

    fn parameters(&self) -> Vec<ProviderParameter> {
        vec![
            ProviderParameter::new(
                params::GCS_ENDPOINT,
                "Endpoint",
                "Custom endpoint, for the storage testbench.",
                "GCS",
                ParameterType::String,
            ),
            ProviderParameter::new(
                params::GCS_BEARER_TOKEN,
                "Bearer token",
                "OAuth2 access token attached to every request.",
                "GCS",
                ParameterType::String,
            ),
        ]
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        match config.scheme() {
            "gs" => true,
            "http" | "https" => config.uri().host_str().is_some_and(|host| {
                host == "storage.googleapis.com" || host.ends_with(".storage.googleapis.com")
            }),
            _ => false,
        }
    }

    fn can_process_headers(&self, _uri: &Url, headers: &HeaderMap) -> bool {
        headers.contains_key("x-goog-generation")
            || headers.contains_key("x-goog-stored-content-length")
            || headers.contains_key("x-guploader-uploadid")
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>> {
        let mut builder = match config.scheme() {
            "gs" => GcsRangeReader::from_uri(config.uri())?,
            _ => {
                let host = config.uri().host_str().unwrap_or_default();
                let path = config.uri().path().trim_start_matches('/');
                if let Some(bucket) = host.strip_suffix(".storage.googleapis.com") {
                    GcsRangeReader::builder(bucket, path)
                } else {
                    let (bucket, object) = path.split_once('/').ok_or_else(|| {
                        Error::configuration(format!(
                            "{} is missing a bucket or object name",
                            config.uri()
                        ))
                    })?;
                    GcsRangeReader::builder(bucket, object)
                }
            }
        };
        if let Some(endpoint) = config.parameter(params::GCS_ENDPOINT) {
            builder = builder.with_endpoint(endpoint)?;
        }
        if let Some(token) = config.parameter(params::GCS_BEARER_TOKEN) {
            builder = builder.with_auth(BearerAuthentication::new(token)?);
        }
        Ok(Box::new(builder.connect().await?))
    }
}

/// Serves Azure Blob Storage URLs, recognized by their endpoint host.
#[derive(Debug)]
struct AzureProvider;

#[async_trait::async_trait]
impl ReaderProvider for AzureProvider {
    fn id(&self) -> &'static str {
        "azure"
    }

    fn description(&self) -> &'static str {
        "Azure Blob Storage"
    }

    fn order(&self) -> i32 {
        30
    }

    fn parameters(&self) -> Vec<ProviderParameter> {
        vec![
            ProviderParameter::new(
                params::AZURE_ACCOUNT,
                "Account",
                "The storage account name.",
                "Azure",
                ParameterType::String,
            ),
            ProviderParameter::new(
                params::AZURE_CONTAINER,
                "Container",
                "The blob container.",
                "Azure",
                ParameterType::String,
            ),
            ProviderParameter::new(
                params::AZURE_BLOB_NAME,
                "Blob name",
                "The blob within the container.",
                "Azure",
                ParameterType::String,
            ),
            ProviderParameter::new(
                params::AZURE_SAS_TOKEN,
                "SAS token",
                "Shared access signature appended to the blob URL.",
                "Azure",
                ParameterType::String,
            ),
            ProviderParameter::new(
                params::AZURE_ENDPOINT,
                "Endpoint",
                "Custom endpoint, for Azurite and sovereign clouds.",
                "Azure",
                ParameterType::String,
            ),
            ProviderParameter::new(
                params::AZURE_BEARER_TOKEN,
                "Bearer token",
                "Microsoft Entra access token attached to every request.",
                "Azure",
                ParameterType::String,
            ),
        ]
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        let from_uri = matches!(config.scheme(), "http" | "https")
            && config
                .uri()
                .host_str()
                .is_some_and(|host| host.ends_with(".blob.core.windows.net"));
        let from_parameters = config.parameter(params::AZURE_ACCOUNT).is_some()
            && config.parameter(params::AZURE_CONTAINER).is_some()
            && config.parameter(params::AZURE_BLOB_NAME).is_some();
        from_uri || from_parameters
    }

    fn can_process_headers(&self, _uri: &Url, headers: &HeaderMap) -> bool {
        headers.contains_key("x-ms-request-id")
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>> {
        let mut builder = match (
            config.parameter(params::AZURE_ACCOUNT),
            config.parameter(params::AZURE_CONTAINER),
            config.parameter(params::AZURE_BLOB_NAME),
        ) {
            (Some(account), Some(container), Some(blob)) => {
                AzureRangeReader::builder(account, container, blob)
            }
            _ => AzureRangeReader::from_uri(config.uri())?,
        };
        if let Some(token) = config.parameter(params::AZURE_SAS_TOKEN) {
            builder = builder.with_sas_token(token);
        }
        if let Some(endpoint) = config.parameter(params::AZURE_ENDPOINT) {
            builder = builder.with_endpoint(endpoint)?;
        }
        if let Some(token) = config.parameter(params::AZURE_BEARER_TOKEN) {
            builder = builder.with_auth(BearerAuthentication::new(token)?);
        }
        Ok(Box::new(builder.connect().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::{InMemoryReader, pattern};
    use httptest::matchers::request;
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};
    use scoped_env::ScopedEnv;
    use serial_test::serial;

    type TestResult = anyhow::Result<()>;

    #[derive(Debug)]
    struct MockCloudProvider {
        id: &'static str,
        order: i32,
        marker: &'static str,
        schemes: &'static [&'static str],
    }

    #[async_trait::async_trait]
    impl ReaderProvider for MockCloudProvider {
        fn id(&self) -> &'static str {
            self.id
        }
        fn description(&self) -> &'static str {
            "mock"
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn parameters(&self) -> Vec<ProviderParameter> {
            Vec::new()
        }
        fn can_process(&self, config: &ReaderConfig) -> bool {
            self.schemes.contains(&config.scheme())
        }
        fn can_process_headers(&self, _uri: &Url, headers: &HeaderMap) -> bool {
            headers.contains_key(self.marker)
        }
        async fn create(&self, _config: &ReaderConfig) -> Result<Box<dyn RangeReader>> {
            Ok(Box::new(InMemoryReader::new(pattern(64))))
        }
    }

    #[tokio::test]
    async fn file_uri_selects_file_provider() -> TestResult {
        let registry = ProviderRegistry::with_defaults();
        let config = ReaderConfig::new("file:///tmp/data.bin")?;
        let provider = registry.select(&config).await?;
        assert_eq!(provider.id(), "file");
        Ok(())
    }

    #[tokio::test]
    async fn scheme_uris_select_their_providers() -> TestResult {
        let registry = ProviderRegistry::with_defaults();
        for (uri, want) in [
            ("s3://bucket/key.bin", "s3"),
            ("gs://bucket/object.bin", "gcs"),
        ] {
            let provider = registry.select(&ReaderConfig::new(uri)?).await?;
            assert_eq!(provider.id(), want, "{uri}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn plain_https_selects_generic_http_without_probe() -> TestResult {
        let registry = ProviderRegistry::with_defaults();
        // An unroutable host: selection must not depend on reaching it.
        let config = ReaderConfig::new("https://tiles.example.invalid/planet.pmtiles")?;
        let provider = registry.select(&config).await?;
        assert_eq!(provider.id(), "http");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_explicit_provider_fails() -> TestResult {
        let registry = ProviderRegistry::with_defaults();
        let config = ReaderConfig::new("file:///tmp/data.bin")?.with_provider_id("zip");
        let err = registry.select(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
        Ok(())
    }

    #[tokio::test]
    #[serial(provider_env)]
    async fn disabled_provider_is_not_selected() -> TestResult {
        let _guard = ScopedEnv::set("IO_TILEVERSE_RANGEREADER_S3", "false");
        let registry = ProviderRegistry::with_defaults();
        let config = ReaderConfig::new("s3://bucket/key.bin")?;
        let err = registry.select(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");

        let config = ReaderConfig::new("s3://bucket/key.bin")?.with_provider_id("s3");
        let err = registry.select(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn no_candidates_fails() -> TestResult {
        let registry = ProviderRegistry::with_defaults();
        let config = ReaderConfig::new("ftp://example.com/data.bin")?;
        let err = registry.select(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn priority_resolves_non_http_schemes() -> TestResult {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-a",
            order: 5,
            marker: "x-mock-a",
            schemes: &["mock"],
        }));
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-b",
            order: 9,
            marker: "x-mock-b",
            schemes: &["mock"],
        }));
        let provider = registry.select(&ReaderConfig::new("mock://host/x")?).await?;
        assert_eq!(provider.id(), "mock-a");
        Ok(())
    }

    #[tokio::test]
    async fn priority_tie_is_an_error_naming_the_ids() -> TestResult {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-a",
            order: 5,
            marker: "x-mock",
            schemes: &["mock"],
        }));
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-b",
            order: 5,
            marker: "x-mock",
            schemes: &["mock"],
        }));
        let err = registry
            .select(&ReaderConfig::new("mock://host/x")?)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
        let msg = format!("{err}");
        assert!(msg.contains("mock-a") && msg.contains("mock-b"), "{msg}");
        Ok(())
    }

    #[tokio::test]
    async fn head_probe_disambiguates_cloud_candidates() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/container/blob.bin"))
                .times(1..)
                .respond_with(status_code(404).append_header("x-mock-b", "1")),
        );

        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-a",
            order: 5,
            marker: "x-mock-a",
            schemes: &["http", "https"],
        }));
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-b",
            order: 9,
            marker: "x-mock-b",
            schemes: &["http", "https"],
        }));
        registry.register(Arc::new(HttpProvider));

        let config = ReaderConfig::for_url(server.url_str("/container/blob.bin").parse()?);
        let provider = registry.select(&config).await?;
        assert_eq!(provider.id(), "mock-b", "the probe headers decide");
        Ok(())
    }

    #[tokio::test]
    async fn head_probe_mismatch_falls_back_to_generic_http() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("HEAD", "/plain.bin"))
                .times(1..)
                .respond_with(status_code(200)),
        );

        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-a",
            order: 5,
            marker: "x-mock-a",
            schemes: &["http", "https"],
        }));
        registry.register(Arc::new(HttpProvider));

        let config = ReaderConfig::for_url(server.url_str("/plain.bin").parse()?);
        let provider = registry.select(&config).await?;
        assert_eq!(provider.id(), "http");
        Ok(())
    }

    #[tokio::test]
    async fn probe_network_failure_resolves_by_priority() -> TestResult {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockCloudProvider {
            id: "mock-a",
            order: 5,
            marker: "x-mock-a",
            schemes: &["http", "https"],
        }));
        registry.register(Arc::new(HttpProvider));

        // Nothing listens on this port; the probe fails at the socket.
        let config = ReaderConfig::new("http://127.0.0.1:1/unreachable.bin")?;
        let provider = registry.select(&config).await?;
        assert_eq!(provider.id(), "mock-a");
        Ok(())
    }

    #[test]
    fn s3_host_detection() {
        assert!(is_s3_host("my-bucket.s3.eu-central-1.amazonaws.com"));
        assert!(is_s3_host("s3.us-west-2.amazonaws.com"));
        assert!(is_s3_host("s3.amazonaws.com"));
        assert!(!is_s3_host("example.com"));
        assert!(!is_s3_host("storage.googleapis.com"));
    }

    #[test]
    fn s3_https_parsing() -> TestResult {
        let (bucket, key, region) =
            parse_s3_https(&Url::parse("https://my-bucket.s3.eu-central-1.amazonaws.com/a/b.bin")?)?;
        assert_eq!((bucket.as_str(), key.as_str()), ("my-bucket", "a/b.bin"));
        assert_eq!(region.as_deref(), Some("eu-central-1"));

        let (bucket, key, region) =
            parse_s3_https(&Url::parse("https://s3.us-west-2.amazonaws.com/my-bucket/a/b.bin")?)?;
        assert_eq!((bucket.as_str(), key.as_str()), ("my-bucket", "a/b.bin"));
        assert_eq!(region.as_deref(), Some("us-west-2"));
        Ok(())
    }

    #[tokio::test]
    async fn azure_parameters_enable_selection_without_azure_host() -> TestResult {
        let registry = ProviderRegistry::with_defaults();
        let config = ReaderConfig::new("https://tiles.example.invalid/ignored")?
            .with_parameter(params::AZURE_ACCOUNT, "myaccount")
            .with_parameter(params::AZURE_CONTAINER, "tiles")
            .with_parameter(params::AZURE_BLOB_NAME, "planet.pmtiles")
            .with_provider_id("azure");
        let provider = registry.select(&config).await?;
        assert_eq!(provider.id(), "azure");
        Ok(())
    }

    #[tokio::test]
    async fn open_applies_decorators_in_order() -> TestResult {
        let dir = tempfile::tempdir()?;
        let data = pattern(100_000);
        let path = dir.path().join("data.bin");
        std::fs::write(&path, &data)?;

        let uri = Url::from_file_path(&path).expect("absolute path");
        let config = ReaderConfig::for_url(uri)
            .with_parameter(params::DISK_CACHE_ENABLED, "true")
            .with_parameter(params::DISK_CACHE_DIRECTORY, dir.path().join("cache").display().to_string())
            .with_parameter(params::MEMORY_CACHE_ENABLED, "true")
            .with_parameter(params::MEMORY_CACHE_MAX_ENTRIES, "16");

        let reader = registry().open(&config).await?;
        assert!(
            reader.source_id().starts_with("memory-cached:disk-cached:file://"),
            "{}",
            reader.source_id()
        );
        let got = reader.read_range(1000, 500).await?;
        assert_eq!(&got[..], &data[1000..1500]);
        Ok(())
    }

    #[tokio::test]
    async fn open_with_block_aligner_above_disk_cache() -> TestResult {
        let dir = tempfile::tempdir()?;
        let data = pattern(10_000);
        let path = dir.path().join("data.bin");
        std::fs::write(&path, &data)?;

        let uri = Url::from_file_path(&path).expect("absolute path");
        let config = ReaderConfig::for_url(uri)
            .with_parameter(params::DISK_CACHE_ENABLED, "true")
            .with_parameter(params::DISK_CACHE_DIRECTORY, dir.path().join("cache").display().to_string())
            .with_parameter(params::DISK_CACHE_BLOCK_SIZE, "1024");

        let reader = registry().open(&config).await?;
        assert!(
            reader.source_id().starts_with("block-aligned:disk-cached:file://"),
            "{}",
            reader.source_id()
        );
        let got = reader.read_range(1500, 300).await?;
        assert_eq!(&got[..], &data[1500..1800]);
        Ok(())
    }
}
