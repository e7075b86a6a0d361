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

//! The error type shared by all readers, decorators, and providers.

use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A convenient alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error returned by all readers in this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: BoxError,
}

impl Error {
    /// Creates a new [Error] with the given [ErrorKind] and source error.
    pub fn new<T: Into<BoxError>>(kind: ErrorKind, source: T) -> Self {
        Error {
            kind,
            source: source.into(),
        }
    }

    /// A helper to create a new [ErrorKind::InvalidArgument] error.
    pub fn invalid_argument<T: Into<BoxError>>(source: T) -> Self {
        Error::new(ErrorKind::InvalidArgument, source)
    }

    /// A helper to create a new [ErrorKind::SourceNotFound] error.
    pub fn source_not_found<T: Into<BoxError>>(source: T) -> Self {
        Error::new(ErrorKind::SourceNotFound, source)
    }

    /// A helper to create a new [ErrorKind::Authentication] error.
    pub fn authentication<T: Into<BoxError>>(source: T) -> Self {
        Error::new(ErrorKind::Authentication, source)
    }

    /// A helper to create a new [ErrorKind::UnsupportedRange] error.
    pub fn unsupported_range<T: Into<BoxError>>(source: T) -> Self {
        Error::new(ErrorKind::UnsupportedRange, source)
    }

    /// A helper to create a new [ErrorKind::Io] error.
    pub fn io<T: Into<BoxError>>(source: T) -> Self {
        Error::new(ErrorKind::Io, source)
    }

    /// A helper to create a new [ErrorKind::Configuration] error.
    pub fn configuration<T: Into<BoxError>>(source: T) -> Self {
        Error::new(ErrorKind::Configuration, source)
    }

    /// Creates an error from an HTTP status code outside the expected set.
    ///
    /// The status determines the kind: authentication challenges and denials
    /// map to [ErrorKind::Authentication], a missing resource maps to
    /// [ErrorKind::SourceNotFound], everything else is an I/O failure that the
    /// retry policies may classify as transient.
    pub fn http(status_code: u16) -> Self {
        let kind = match status_code {
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::SourceNotFound,
            _ => ErrorKind::Io,
        };
        Error::new(kind, HttpStatusError { status_code })
    }

    /// Wraps an error shared behind an [Arc], preserving its kind and chain.
    ///
    /// Cache loaders hand the same failure to every waiter, so the original
    /// error is only available through a shared reference.
    pub(crate) fn shared(source: Arc<Error>) -> Self {
        Error {
            kind: source.kind(),
            source: Box::new(SharedError(source)),
        }
    }

    /// Returns the [ErrorKind] associated with this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    /// Returns the HTTP status code that produced this error, if any.
    pub fn http_status_code(&self) -> Option<u16> {
        self.as_inner::<HttpStatusError>().map(|e| e.status_code)
    }

    /// Recurses through the source error chain and returns a reference to the
    /// inner value if it is of type `T`, or `None` if no such inner value is
    /// found.
    pub fn as_inner<T: std::error::Error + Send + Sync + 'static>(&self) -> Option<&T> {
        let mut error = self.source.as_ref() as &dyn std::error::Error;
        loop {
            match error.downcast_ref::<T>() {
                Some(e) => return Some(e),
                None => error = error.source()?,
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// The type of error held by an [Error] instance.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ErrorKind {
    /// A caller error: bad offset/length combination, insufficient target
    /// capacity, or a malformed builder input.
    InvalidArgument,
    /// The object or file does not exist at construction time.
    SourceNotFound,
    /// The server rejected the configured credentials.
    Authentication,
    /// The server does not honor byte ranges. Fatal for the reader instance.
    UnsupportedRange,
    /// A network, disk, timeout, or protocol failure. Possibly transient.
    #[default]
    Io,
    /// An ambiguous or unresolvable reader configuration.
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::SourceNotFound => write!(f, "source not found"),
            ErrorKind::Authentication => write!(f, "authentication failed"),
            ErrorKind::UnsupportedRange => write!(f, "byte ranges not supported by the source"),
            ErrorKind::Io => write!(f, "a problem occurred during I/O"),
            ErrorKind::Configuration => write!(f, "invalid reader configuration"),
        }
    }
}

/// An HTTP response completed with an unexpected status code.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("unexpected HTTP status {status_code}")]
pub struct HttpStatusError {
    status_code: u16,
}

impl HttpStatusError {
    pub fn new(status_code: u16) -> Self {
        Self { status_code }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }
}

#[derive(Debug)]
struct SharedError(Arc<Error>);

impl std::fmt::Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.0.as_ref(), f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}
