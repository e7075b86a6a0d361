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

//! Authentication capabilities for HTTP-based readers.
//!
//! An authenticator attaches credentials to outgoing requests. Readers hold
//! the capability as an opaque `Arc<dyn HttpAuthentication>`; where the
//! credentials come from (environment, key stores, token services) is the
//! caller's concern.

use crate::Result;
use crate::error::Error;
use base64::Engine as _;
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};

/// Attaches credentials to outgoing HTTP requests.
///
/// Implementations are immutable and safe to share across concurrent
/// requests. A single authenticator may back many readers.
pub trait HttpAuthentication: Send + Sync + std::fmt::Debug {
    /// Attaches one or more headers to the request.
    fn apply(&self, request: &mut reqwest::Request) -> Result<()>;

    /// Reacts to a `401 Unauthorized` response.
    ///
    /// Challenge-response schemes return [ChallengeAction::Retry] after
    /// absorbing the challenge so the caller re-issues the request once with
    /// fresh credentials. Everything else fails the request.
    fn on_unauthorized(&self, _headers: &HeaderMap) -> ChallengeAction {
        ChallengeAction::Fail
    }
}

/// What to do with a request that was answered with `401 Unauthorized`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeAction {
    /// Re-issue the request once; the authenticator absorbed the challenge.
    Retry,
    /// Give up and surface an authentication error.
    Fail,
}

/// Sends requests without credentials.
#[derive(Clone, Debug, Default)]
pub struct NoAuthentication;

impl HttpAuthentication for NoAuthentication {
    fn apply(&self, _request: &mut reqwest::Request) -> Result<()> {
        Ok(())
    }
}

/// HTTP Basic authentication (RFC 7617).
pub struct BasicAuthentication {
    header: HeaderValue,
}

impl BasicAuthentication {
    pub fn new(username: impl AsRef<str>, password: impl AsRef<str>) -> Result<Self> {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username.as_ref(), password.as_ref()));
        let mut header = HeaderValue::from_str(&format!("Basic {token}"))
            .map_err(Error::configuration)?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

impl HttpAuthentication for BasicAuthentication {
    fn apply(&self, request: &mut reqwest::Request) -> Result<()> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.header.clone());
        Ok(())
    }
}

impl std::fmt::Debug for BasicAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthentication").finish_non_exhaustive()
    }
}

/// Bearer token authentication (RFC 6750).
pub struct BearerAuthentication {
    header: HeaderValue,
}

impl BearerAuthentication {
    pub fn new(token: impl AsRef<str>) -> Result<Self> {
        let mut header = HeaderValue::from_str(&format!("Bearer {}", token.as_ref()))
            .map_err(Error::configuration)?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

impl HttpAuthentication for BearerAuthentication {
    fn apply(&self, request: &mut reqwest::Request) -> Result<()> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.header.clone());
        Ok(())
    }
}

impl std::fmt::Debug for BearerAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuthentication").finish_non_exhaustive()
    }
}

/// API key authentication with a configurable header name.
pub struct ApiKeyAuthentication {
    name: HeaderName,
    value: HeaderValue,
}

impl ApiKeyAuthentication {
    pub fn new(header_name: impl AsRef<str>, key: impl AsRef<str>) -> Result<Self> {
        let name =
            HeaderName::from_bytes(header_name.as_ref().as_bytes()).map_err(Error::configuration)?;
        let mut value = HeaderValue::from_str(key.as_ref()).map_err(Error::configuration)?;
        value.set_sensitive(true);
        Ok(Self { name, value })
    }
}

impl HttpAuthentication for ApiKeyAuthentication {
    fn apply(&self, request: &mut reqwest::Request) -> Result<()> {
        request
            .headers_mut()
            .insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}

impl std::fmt::Debug for ApiKeyAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuthentication")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A fixed set of headers attached to every request.
pub struct CustomHeaderAuthentication {
    headers: HeaderMap,
}

impl CustomHeaderAuthentication {
    pub fn new<I, K, V>(headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            let name =
                HeaderName::from_bytes(k.as_ref().as_bytes()).map_err(Error::configuration)?;
            let value = HeaderValue::from_str(v.as_ref()).map_err(Error::configuration)?;
            map.insert(name, value);
        }
        Ok(Self { headers: map })
    }
}

impl HttpAuthentication for CustomHeaderAuthentication {
    fn apply(&self, request: &mut reqwest::Request) -> Result<()> {
        for (name, value) in self.headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for CustomHeaderAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomHeaderAuthentication")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = anyhow::Result<()>;

    fn request() -> reqwest::Request {
        reqwest::Request::new(
            reqwest::Method::GET,
            "https://example.com/data.bin".parse().unwrap(),
        )
    }

    #[test]
    fn basic_encodes_credentials() -> TestResult {
        let auth = BasicAuthentication::new("aladdin", "opensesame")?;
        let mut request = request();
        auth.apply(&mut request)?;
        let got = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(got, "Basic YWxhZGRpbjpvcGVuc2VzYW1l");
        Ok(())
    }

    #[test]
    fn bearer_sets_authorization() -> TestResult {
        let auth = BearerAuthentication::new("tok-123")?;
        let mut request = request();
        auth.apply(&mut request)?;
        let got = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(got, "Bearer tok-123");
        Ok(())
    }

    #[test]
    fn api_key_uses_custom_header() -> TestResult {
        let auth = ApiKeyAuthentication::new("x-api-key", "secret")?;
        let mut request = request();
        auth.apply(&mut request)?;
        assert_eq!(request.headers().get("x-api-key").unwrap(), "secret");
        Ok(())
    }

    #[test]
    fn custom_headers_apply_all() -> TestResult {
        let auth = CustomHeaderAuthentication::new([
            ("x-ms-version", "2025-01-05"),
            ("x-custom", "value"),
        ])?;
        let mut request = request();
        auth.apply(&mut request)?;
        assert_eq!(request.headers().get("x-ms-version").unwrap(), "2025-01-05");
        assert_eq!(request.headers().get("x-custom").unwrap(), "value");
        Ok(())
    }

    #[test]
    fn default_challenge_action_fails() {
        let auth = NoAuthentication;
        assert_eq!(auth.on_unauthorized(&HeaderMap::new()), ChallengeAction::Fail);
    }

    #[test]
    fn debug_does_not_leak_secrets() -> TestResult {
        let auth = BasicAuthentication::new("user", "hunter2")?;
        let msg = format!("{auth:?}");
        assert!(!msg.contains("hunter2"), "{msg}");
        Ok(())
    }
}
