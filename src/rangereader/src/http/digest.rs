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

//! HTTP Digest authentication (RFC 7616).
//!
//! The authenticator starts idle. The first `401` carrying a
//! `WWW-Authenticate: Digest` challenge moves it to the challenged state;
//! subsequent requests carry a computed `Authorization: Digest` header. A
//! `401` with `stale=true` re-enters the challenged state with the fresh
//! nonce; any other `401` after authorization is fatal for that request.

use super::auth::{ChallengeAction, HttpAuthentication};
use crate::Result;
use crate::error::Error;
use crate::unpoisoned;
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use rand::Rng as _;
use sha2::Digest as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// HTTP Digest authentication with challenge-response state.
///
/// The nonce count is monotonic for the lifetime of the authenticator, also
/// under concurrent requests. The client nonce is fresh per request.
pub struct DigestAuthentication {
    username: String,
    password: String,
    challenge: Mutex<Option<Challenge>>,
    nonce_count: AtomicU64,
}

#[derive(Clone, Debug, PartialEq)]
struct Challenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    algorithm: Algorithm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    fn hash(&self, input: &str) -> String {
        match self {
            Algorithm::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
            Algorithm::Sha256 => hex::encode(sha2::Sha256::digest(input.as_bytes())),
        }
    }

    fn token(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha256 => "SHA-256",
        }
    }
}

impl DigestAuthentication {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge: Mutex::new(None),
            nonce_count: AtomicU64::new(0),
        }
    }

    fn authorization(&self, challenge: &Challenge, method: &str, uri: &str) -> Result<HeaderValue> {
        let nc = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
        let nc = format!("{nc:08x}");
        let cnonce: String = {
            let mut rng = rand::rng();
            (0..16)
                .map(|_| format!("{:x}", rng.random_range(0..16_u8)))
                .collect()
        };
        let ha1 = challenge.algorithm.hash(&format!(
            "{}:{}:{}",
            self.username, challenge.realm, self.password
        ));
        let ha2 = challenge.algorithm.hash(&format!("{method}:{uri}"));
        let response = if challenge.qop_auth {
            challenge.algorithm.hash(&format!(
                "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
                challenge.nonce
            ))
        } else {
            challenge
                .algorithm
                .hash(&format!("{ha1}:{}:{ha2}", challenge.nonce))
        };
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", \
             algorithm={}, response=\"{response}\"",
            self.username,
            challenge.realm,
            challenge.nonce,
            challenge.algorithm.token(),
        );
        if challenge.qop_auth {
            header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        let mut value = HeaderValue::from_str(&header).map_err(Error::authentication)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl HttpAuthentication for DigestAuthentication {
    fn apply(&self, request: &mut reqwest::Request) -> Result<()> {
        let challenge = unpoisoned(self.challenge.lock()).clone();
        let Some(challenge) = challenge else {
            // Idle: the first request goes out bare and absorbs the 401.
            return Ok(());
        };
        let uri = match request.url().query() {
            Some(query) => format!("{}?{query}", request.url().path()),
            None => request.url().path().to_string(),
        };
        let header = self.authorization(&challenge, request.method().as_str(), &uri)?;
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(())
    }

    fn on_unauthorized(&self, headers: &HeaderMap) -> ChallengeAction {
        let Some(parsed) = headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
        else {
            return ChallengeAction::Fail;
        };
        let mut guard = unpoisoned(self.challenge.lock());
        match guard.as_ref() {
            // Re-challenged with a fresh nonce: retry with it.
            Some(previous) if parsed.stale || previous.nonce != parsed.challenge.nonce => {
                *guard = Some(parsed.challenge);
                ChallengeAction::Retry
            }
            // Same nonce, not stale: the credentials were rejected.
            Some(_) => ChallengeAction::Fail,
            None => {
                *guard = Some(parsed.challenge);
                ChallengeAction::Retry
            }
        }
    }
}

impl std::fmt::Debug for DigestAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestAuthentication")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

struct ParsedChallenge {
    challenge: Challenge,
    stale: bool,
}

/// Parses a `WWW-Authenticate: Digest` header value.
fn parse_challenge(value: &str) -> Option<ParsedChallenge> {
    let rest = value.trim().strip_prefix("Digest")?;
    let mut realm = None;
    let mut nonce = None;
    let mut opaque = None;
    let mut qop_auth = false;
    let mut algorithm = Algorithm::Md5;
    let mut stale = false;
    for (key, value) in parse_parameters(rest) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "opaque" => opaque = Some(value),
            "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
            "stale" => stale = value.eq_ignore_ascii_case("true"),
            "algorithm" => {
                algorithm = match value.to_ascii_uppercase().as_str() {
                    "MD5" => Algorithm::Md5,
                    "SHA-256" => Algorithm::Sha256,
                    _ => return None,
                }
            }
            _ => {}
        }
    }
    Some(ParsedChallenge {
        challenge: Challenge {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop_auth,
            algorithm,
        },
        stale,
    })
}

/// Splits `key="quoted value", key=token, ...` into pairs.
fn parse_parameters(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            key.push(c);
        }
        if chars.next() != Some('=') {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    Some('"') | None => break,
                    Some(c) => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }
        pairs.push((key.trim().to_string(), value.trim().to_string()));
        if chars.peek().is_none() {
            break;
        }
    }
    pairs
}
