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

//! The configuration record consumed by providers and the factory.

use crate::Result;
use crate::error::Error;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// A source URI plus typed parameters, the input to reader selection.
///
/// Parameters use dotted, vendor-prefixed keys
/// (`io.tileverse.rangereader.<provider>.<name>`). Providers ignore keys they
/// do not recognize, so configurations survive library upgrades.
///
/// # Example
/// ```
/// # use tileverse_rangereader::config::ReaderConfig;
/// let config = ReaderConfig::new("s3://my-bucket/tiles.pmtiles")?
///     .with_parameter("io.tileverse.rangereader.s3.region", "eu-central-1")
///     .with_parameter("io.tileverse.rangereader.memory-cache.enabled", "true");
/// assert_eq!(config.scheme(), "s3");
/// # Ok::<(), tileverse_rangereader::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    uri: Url,
    parameters: BTreeMap<String, String>,
    provider_id: Option<String>,
}

impl ReaderConfig {
    /// Creates a configuration for `uri`.
    pub fn new(uri: impl AsRef<str>) -> Result<Self> {
        let uri = Url::parse(uri.as_ref()).map_err(|e| {
            Error::configuration(format!("malformed source URI {}: {e}", uri.as_ref()))
        })?;
        Ok(Self::for_url(uri))
    }

    /// Creates a configuration for an already parsed URL.
    pub fn for_url(uri: Url) -> Self {
        Self {
            uri,
            parameters: BTreeMap::new(),
            provider_id: None,
        }
    }

    /// Adds one parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Forces a specific provider instead of URI matching.
    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    /// The source URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// The URI scheme, lower-cased by the parser.
    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    /// The explicitly requested provider, if any.
    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    /// All parameter keys, for diagnostics.
    pub fn parameter_keys(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    /// A raw parameter value.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// A boolean parameter; accepts `true`/`false` in any case.
    pub fn bool_parameter(&self, key: &str) -> Result<Option<bool>> {
        self.parameter(key)
            .map(|v| {
                if v.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else if v.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else {
                    Err(Error::configuration(format!(
                        "{key}: expected true or false, got {v:?}"
                    )))
                }
            })
            .transpose()
    }

    /// An unsigned integer parameter.
    pub fn u64_parameter(&self, key: &str) -> Result<Option<u64>> {
        self.parameter(key)
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    Error::configuration(format!("{key}: expected an integer, got {v:?} ({e})"))
                })
            })
            .transpose()
    }

    /// An unsigned 32-bit integer parameter.
    pub fn u32_parameter(&self, key: &str) -> Result<Option<u32>> {
        self.parameter(key)
            .map(|v| {
                v.parse::<u32>().map_err(|e| {
                    Error::configuration(format!("{key}: expected an integer, got {v:?} ({e})"))
                })
            })
            .transpose()
    }

    /// A duration parameter, in milliseconds.
    pub fn duration_parameter(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.u64_parameter(key)?.map(Duration::from_millis))
    }

    /// A filesystem path parameter.
    pub fn path_parameter(&self, key: &str) -> Option<PathBuf> {
        self.parameter(key).map(PathBuf::from)
    }
}
