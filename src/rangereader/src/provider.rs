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

//! The provider contract: how backends plug into reader selection.

use crate::Result;
use crate::config::ReaderConfig;
use crate::reader::RangeReader;
use http::HeaderMap;
use url::Url;

/// The value type of a [ProviderParameter].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    /// Milliseconds.
    Duration,
    /// A filesystem path.
    Path,
}

/// Describes one typed knob a provider accepts.
///
/// Declared parameters drive configuration UIs and validation; a provider
/// ignores keys it did not declare.
#[derive(Clone, Debug)]
pub struct ProviderParameter {
    pub key: String,
    pub title: String,
    pub description: String,
    pub group: String,
    pub subgroup: Option<String>,
    pub parameter_type: ParameterType,
    pub default: Option<String>,
    pub samples: Vec<String>,
}

impl ProviderParameter {
    pub fn new(
        key: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        group: impl Into<String>,
        parameter_type: ParameterType,
    ) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            description: description.into(),
            group: group.into(),
            subgroup: None,
            parameter_type,
            default: None,
            samples: Vec::new(),
        }
    }

    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        self.subgroup = Some(subgroup.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_samples<I, S>(mut self, samples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.samples = samples.into_iter().map(Into::into).collect();
        self
    }
}

/// A plug-in that recognizes URIs and constructs backend readers for them.
///
/// Providers register in a [ProviderRegistry][crate::factory::ProviderRegistry];
/// given a [ReaderConfig] the registry picks one deterministically (see the
/// factory module for the selection rules).
#[async_trait::async_trait]
pub trait ReaderProvider: Send + Sync + std::fmt::Debug {
    /// A short stable identifier (`file`, `http`, `s3`, `azure`, `gcs`).
    fn id(&self) -> &'static str;

    /// A human-readable description of the backend.
    fn description(&self) -> &'static str;

    /// Selection priority; lower wins when several providers match.
    fn order(&self) -> i32;

    /// The parameters this provider recognizes.
    fn parameters(&self) -> Vec<ProviderParameter>;

    /// Whether this provider can build a reader for `config`.
    fn can_process(&self, config: &ReaderConfig) -> bool;

    /// Whether the response headers of a `HEAD` probe to `uri` identify this
    /// provider's service. Used to disambiguate generic HTTP URLs.
    fn can_process_headers(&self, _uri: &Url, _headers: &HeaderMap) -> bool {
        false
    }

    /// Builds the backend reader.
    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>>;
}

/// Whether `IO_TILEVERSE_RANGEREADER_{ID}` leaves the provider enabled.
///
/// Only the literal value `false` (any case) disables a provider; anything
/// else, including an unset variable, leaves it on. Checked at registry query
/// time, so a test or an operator can flip providers without rebuilding
/// registries.
pub fn provider_enabled(id: &str) -> bool {
    let variable = format!(
        "IO_TILEVERSE_RANGEREADER_{}",
        id.to_uppercase().replace('-', "_")
    );
    !matches!(std::env::var(variable), Ok(v) if v.eq_ignore_ascii_case("false"))
}
