// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]
//! Errors of the stash HTTP cache
//!
//! A failure is a boxed [Error]: an [ErrorType], the side it came from ([ErrorSource]), an
//! optional context string and an optional cause. Callers branch on [Error::etype], or on
//! [Error::code] for the errno-like codes of the fetch layer (`ENOTCACHED`, `EINTEGRITY`,
//! `ENOENT`, ...).

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::result::Result as StdResult;

pub type BError = Box<Error>;
pub type Result<T, E = BError> = StdResult<T, E>;
/// Static contexts are not allocated
pub type ErrorContext = Cow<'static, str>;
/// Anything that can sit in the cause chain
pub type Cause = Box<dyn ErrorTrait + Send + Sync>;

#[derive(Debug)]
pub struct Error {
    pub etype: ErrorType,
    pub esource: ErrorSource,
    /// Whether the request that failed may be sent again
    pub retry: bool,
    pub cause: Option<Cause>,
    pub context: Option<ErrorContext>,
}

/// Which side of the cache failed
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSource {
    /// The origin, or the transport talking to it
    Upstream,
    /// The content store
    Store,
    Internal,
    Unset,
}

impl ErrorSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Upstream => "Upstream",
            Self::Store => "Store",
            Self::Internal => "Internal",
            Self::Unset => "",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    // cache
    /// `only-if-cached` and nothing usable is stored
    NotCached,
    /// Content does not match its integrity
    IntegrityError,
    /// Content the index points at is gone
    NotFound,
    StorageError,
    InvalidIntegrity,
    InvalidIndex,
    // network
    ConnectTimedout,
    ConnectRefused,
    ConnectError,
    ReadError,
    ReadTimedout,
    WriteError,
    UnsupportedProxy,
    // request and response
    InvalidHTTPHeader,
    InvalidUrl,
    TooManyRedirects,
    RedirectForbidden,
    InvalidRedirect,
    // files
    FileOpenError,
    FileCreateError,
    FileReadError,
    FileWriteError,
    InternalError,
    UnknownError,
    /// A type defined by a user of this crate. Runtime strings belong in the context.
    Custom(&'static str),
}

impl ErrorType {
    /// A new type of error, `name` should be unique
    pub const fn new(name: &'static str) -> Self {
        ErrorType::Custom(name)
    }

    pub fn as_str(&self) -> &str {
        use ErrorType::*;
        match self {
            NotCached => "NotCached",
            IntegrityError => "IntegrityError",
            NotFound => "NotFound",
            StorageError => "StorageError",
            InvalidIntegrity => "InvalidIntegrity",
            InvalidIndex => "InvalidIndex",
            ConnectTimedout => "ConnectTimedout",
            ConnectRefused => "ConnectRefused",
            ConnectError => "ConnectError",
            ReadError => "ReadError",
            ReadTimedout => "ReadTimedout",
            WriteError => "WriteError",
            UnsupportedProxy => "UnsupportedProxy",
            InvalidHTTPHeader => "InvalidHTTPHeader",
            InvalidUrl => "InvalidUrl",
            TooManyRedirects => "TooManyRedirects",
            RedirectForbidden => "RedirectForbidden",
            InvalidRedirect => "InvalidRedirect",
            FileOpenError => "FileOpenError",
            FileCreateError => "FileCreateError",
            FileReadError => "FileReadError",
            FileWriteError => "FileWriteError",
            InternalError => "InternalError",
            UnknownError => "UnknownError",
            Custom(s) => s,
        }
    }

    /// The well known code of this type, if it has one
    pub fn code(&self) -> Option<&'static str> {
        use ErrorType::*;
        let code = match self {
            NotCached => "ENOTCACHED",
            IntegrityError => "EINTEGRITY",
            NotFound => "ENOENT",
            UnsupportedProxy => "EUNSUPPORTEDPROXY",
            TooManyRedirects => "EMAXREDIRECT",
            RedirectForbidden => "ENOREDIRECT",
            InvalidRedirect => "EINVALIDREDIRECT",
            ConnectTimedout | ReadTimedout => "ETIMEDOUT",
            ConnectRefused => "ECONNREFUSED",
            _ => return None,
        };
        Some(code)
    }

    /// Network failures, the ones a request may be retried after
    pub fn is_transport(&self) -> bool {
        use ErrorType::*;
        matches!(
            self,
            ConnectTimedout | ConnectRefused | ConnectError | ReadError | ReadTimedout | WriteError
        )
    }

    // errors whose code is the one of the I/O error that caused them
    fn is_io(&self) -> bool {
        use ErrorType::*;
        matches!(
            self,
            StorageError | FileOpenError | FileCreateError | FileReadError | FileWriteError
        )
    }
}

fn io_code(e: &io::Error) -> &'static str {
    use io::ErrorKind::*;
    match e.kind() {
        NotFound => "ENOENT",
        PermissionDenied => "EACCES",
        AlreadyExists => "EEXIST",
        NotADirectory => "ENOTDIR",
        IsADirectory => "EISDIR",
        StorageFull => "ENOSPC",
        _ => "EIO",
    }
}

impl Error {
    /// Build an error from all its parts
    ///
    /// Unless `cause` is itself an [Error], `retry` is derived from the type.
    pub fn create(
        etype: ErrorType,
        esource: ErrorSource,
        context: Option<ErrorContext>,
        cause: Option<Cause>,
    ) -> BError {
        let retry = cause
            .as_ref()
            .and_then(|c| c.downcast_ref::<BError>())
            .map_or_else(|| etype.is_transport(), |e| e.retry);
        Box::new(Error {
            etype,
            esource,
            retry,
            cause,
            context,
        })
    }

    pub fn new(etype: ErrorType) -> BError {
        Self::create(etype, ErrorSource::Unset, None, None)
    }

    /// An error with a context string and no cause
    pub fn explain<S: Into<ErrorContext>>(etype: ErrorType, context: S) -> BError {
        Self::create(etype, ErrorSource::Unset, Some(context.into()), None)
    }

    pub fn e_explain<T, S: Into<ErrorContext>>(etype: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(etype, context))
    }

    /// An error caused by another one
    ///
    /// ```
    /// use stash_error::{Error, ErrorType, Result};
    ///
    /// fn read_bucket() -> Result<Vec<u8>> {
    ///     std::fs::read("/nonexistent/bucket")
    ///         .map_err(|e| Error::because(ErrorType::FileReadError, "reading bucket", e))
    /// }
    /// assert_eq!(read_bucket().unwrap_err().code(), Some("ENOENT"));
    /// ```
    pub fn because<S, E>(etype: ErrorType, context: S, cause: E) -> BError
    where
        S: Into<ErrorContext>,
        E: Into<Cause>,
    {
        Self::create(
            etype,
            ErrorSource::Unset,
            Some(context.into()),
            Some(cause.into()),
        )
    }

    pub fn e_because<T, S, E>(etype: ErrorType, context: S, cause: E) -> Result<T>
    where
        S: Into<ErrorContext>,
        E: Into<Cause>,
    {
        Err(Self::because(etype, context, cause))
    }

    /// Wrap this error in one of the same type, source and retry flag, with more context
    pub fn more_context<S: Into<ErrorContext>>(self: BError, context: S) -> BError {
        let (esource, retry) = (self.esource, self.retry);
        let mut e = Self::because(self.etype.clone(), context, self);
        e.esource = esource;
        e.retry = retry;
        e
    }

    fn with_source(mut self: BError, esource: ErrorSource) -> BError {
        self.esource = esource;
        self
    }

    /// Mark the error as coming from the origin side
    pub fn into_up(self: BError) -> BError {
        self.with_source(ErrorSource::Upstream)
    }

    /// Mark the error as coming from the content store
    pub fn into_store(self: BError) -> BError {
        self.with_source(ErrorSource::Store)
    }

    pub fn into_in(self: BError) -> BError {
        self.with_source(ErrorSource::Internal)
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    pub fn esource(&self) -> &ErrorSource {
        &self.esource
    }

    pub fn retry(&self) -> bool {
        self.retry
    }

    pub fn set_cause<C: Into<Cause>>(&mut self, cause: C) {
        self.cause = Some(cause.into());
    }

    // the errors wrapped by this one, this one first
    fn chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |e| {
            e.cause
                .as_ref()
                .and_then(|c| c.downcast_ref::<BError>())
                .map(|b| b.as_ref())
        })
    }

    /// The errno-like code of this error
    ///
    /// Types with a well known code return it. Storage and file errors return the code of the
    /// I/O error that caused them, e.g. `ENOTDIR` when the cache path is a file. Otherwise the
    /// code of the first wrapped error that has one.
    pub fn code(&self) -> Option<&'static str> {
        self.chain().find_map(|e| {
            if let Some(code) = e.etype.code() {
                return Some(code);
            }
            if !e.etype.is_io() {
                return None;
            }
            e.cause
                .as_ref()
                .and_then(|c| c.downcast_ref::<io::Error>())
                .map(io_code)
        })
    }

    /// The type of the innermost [Error] in the chain
    pub fn root_etype(&self) -> &ErrorType {
        self.chain().last().map_or(&self.etype, |e| &e.etype)
    }
}

impl fmt::Display for Error {
    // repeated sources and types along the chain are printed once
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut levels = Vec::new();
        let mut previous: Option<&Error> = None;
        for e in self.chain() {
            let mut parts = Vec::new();
            let source = e.esource.as_str();
            if !source.is_empty() && previous.map_or(true, |p| p.esource != e.esource) {
                parts.push(source.to_string());
            }
            if previous.map_or(true, |p| p.etype != e.etype) {
                parts.push(e.etype.as_str().to_string());
            }
            if let Some(context) = e.context.as_ref() {
                parts.push(format!("context: {context}"));
            }
            if !parts.is_empty() {
                levels.push(parts.join(" "));
            }
            previous = Some(e);
        }
        // a foreign error ends the chain
        if let Some(cause) = previous.and_then(|e| e.cause.as_ref()) {
            if cause.downcast_ref::<BError>().is_none() {
                levels.push(cause.to_string());
            }
        }
        write!(f, "{}", levels.join(" cause: "))
    }
}

impl ErrorTrait for Error {}

/// Add context to the error of a [Result]
pub trait Context<T> {
    /// The current error becomes the cause of one with the same type and more context
    fn err_context<C: Into<ErrorContext>, F: FnOnce() -> C>(self, context: F) -> Result<T>;
}

impl<T> Context<T> for Result<T> {
    fn err_context<C: Into<ErrorContext>, F: FnOnce() -> C>(self, context: F) -> Result<T> {
        self.map_err(|e| e.more_context(context()))
    }
}

/// Turn foreign errors into [Error]s
pub trait OrErr<T, E> {
    /// The foreign error becomes the cause of a new one of type `et`
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T>
    where
        E: Into<Cause>;

    /// [OrErr::or_err] with a context built only on failure
    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>
    where
        E: Into<Cause>;

    /// Describe the foreign error in the context instead of keeping it as the cause
    fn explain_err<C: Into<ErrorContext>, F: FnOnce(E) -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>;
}

impl<T, E> OrErr<T, E> for StdResult<T, E> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(et, context, e))
    }

    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(et, context(), e))
    }

    fn explain_err<C: Into<ErrorContext>, F: FnOnce(E) -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T> {
        self.map_err(|e| Error::explain(et, context(e)))
    }
}

/// Turn a missing value into an [Error]
pub trait OkOrErr<T> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T>;

    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T>;
}

impl<T> OkOrErr<T> for Option<T> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T> {
        self.ok_or_else(|| Error::explain(et, context))
    }

    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T> {
        self.ok_or_else(|| Error::explain(et, context()))
    }
}
