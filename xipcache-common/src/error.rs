// Copyright 2025 xipcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// All kinds of [`Error`] raised by xipcache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// I/O error from the backing store.
    Io,
    /// External error.
    External,
    /// Invalid device configuration.
    Config,
    /// Bad file handle, unknown file or malformed offset/length.
    InvalidRequest,
    /// The file handle does not permit the requested direction.
    PermissionDenied,
    /// The backing store cannot report a layout for the requested range.
    LayoutUnavailable,
    /// Allocation cannot proceed even after eviction.
    ResourceExhausted,
    /// An index insert found an existing entry with incompatible metadata.
    ConflictingExtent,
    /// The byte copy stopped early.
    ///
    /// The number of bytes actually transferred is recorded in the context, see [`Error::transferred`].
    PartialTransfer,
    /// Writing a dirty extent back to the backing store failed.
    WriteBackFailure,
    /// Access through a mapping could not be resolved (bus error equivalent).
    Fault,
    /// The cache file record was evicted while the request waited on it.
    Retired,
    /// The device has been detached.
    Closed,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }

    /// Whether the boundary layer reports this kind as a retryable failure.
    ///
    /// Rejected calls (invalid request, permission) and data errors are not retryable.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::LayoutUnavailable | ErrorKind::ResourceExhausted | ErrorKind::Retired
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Io => "I/O error",
            ErrorKind::External => "External error",
            ErrorKind::Config => "Config error",
            ErrorKind::InvalidRequest => "Invalid request",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::LayoutUnavailable => "Layout unavailable",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::ConflictingExtent => "Conflicting extent",
            ErrorKind::PartialTransfer => "Partial transfer",
            ErrorKind::WriteBackFailure => "Write-back failure",
            ErrorKind::Fault => "Fault",
            ErrorKind::Retired => "Cache file retired",
            ErrorKind::Closed => "Closed",
        }
    }
}

/// Error is the error struct returned by all xipcache functions.
///
/// ## Display
///
/// Via `Display`, the error is printed in a single line:
///
/// ```shell
/// Partial transfer, context: { offset: 0, transferred: 4096 } => missing cache block, source: ...
/// ```
///
/// Via `Debug`, the error is printed in multiple lines with context, source and the captured backtrace.
/// `format!("{err:#?}")` gives the conventional struct-style representation.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, use the `with_source` method.
    ///
    /// ```rust
    /// # use xipcache_common::error::{Error, ErrorKind};
    /// let io_error = std::io::Error::other("disk on fire");
    /// Error::new(ErrorKind::WriteBackFailure, "write back victim extent").with_source(io_error);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// Setting the source twice panics in debug builds.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Look up a context value by key. The latest value wins.
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Bytes transferred before a [`ErrorKind::PartialTransfer`] stopped the copy.
    ///
    /// Returns `None` for any other kind.
    pub fn transferred(&self) -> Option<usize> {
        if self.kind != ErrorKind::PartialTransfer {
            return None;
        }
        self.context_value("transferred").and_then(|v| v.parse().ok())
    }
}

/// Result type for xipcache.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Io`] error from [`std::io::Error`].
    pub fn io_error(source: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, "backing store I/O").with_source(source)
    }

    /// Helper for creating an [`ErrorKind::InvalidRequest`] error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidRequest, message)
    }

    /// Helper for creating an [`ErrorKind::ResourceExhausted`] error with context.
    pub fn resource_exhausted(total: usize, free: usize, required: usize) -> Self {
        Error::new(ErrorKind::ResourceExhausted, "not enough cache blocks after eviction")
            .with_context("total", total)
            .with_context("free", free)
            .with_context("required", required)
    }

    /// Helper for creating a [`ErrorKind::PartialTransfer`] error carrying the transferred byte count.
    pub fn partial_transfer(transferred: usize, message: impl Into<String>) -> Self {
        Error::new(ErrorKind::PartialTransfer, message).with_context("transferred", transferred)
    }

    /// Helper for creating a [`ErrorKind::Fault`] error for the given file offset.
    pub fn fault(offset: u64, message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Fault, message).with_context("offset", offset)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e)
    }
}
