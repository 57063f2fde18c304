//! Error types for the convertd library.
//!
//! One enum, two audiences:
//!
//! * Rust callers match on [`ConvertError`] variants directly and get the
//!   full structured context (paths, limits, engine exit codes).
//!
//! * Service wrappers (HTTP, queue consumers) call [`ConvertError::kind`]
//!   and forward the stable machine-readable kind string plus the `Display`
//!   message, without caring which concrete variant produced it.
//!
//! The kinds mirror the handler contract: a request either never reaches
//! the engine (`VALIDATION`, `RESOURCE_LIMIT`), reaches it and is cut off
//! (`TIMEOUT`, `CANCELLED`), reaches it and the engine refuses
//! (`ENGINE`), or fails for reasons unrelated to the document itself
//! (`INTERNAL`). `STARTUP_FATAL` never flows through a request at all —
//! it aborts the preparation stage before the first request is accepted.

use crate::format::DocumentFormat;
use crate::sniff::FileCondition;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the convertd library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Preparation stage ─────────────────────────────────────────────────
    /// A preparation tool is missing or exited non-zero. The service must
    /// not begin serving requests.
    #[error("startup failed during {stage}: {detail}")]
    StartupFatal { stage: &'static str, detail: String },

    // ── Request validation (engine never invoked) ─────────────────────────
    /// Input file was not found at the given path.
    #[error("input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Source format was neither declared nor inferable from the input.
    #[error("cannot determine source format of '{input}'; declare it explicitly")]
    UnknownSourceFormat { input: String },

    /// The (source → target) pair is outside the supported conversion
    /// matrix. The source format lives in `from`; a field named `source`
    /// would be claimed by the error-source machinery.
    #[error("conversion {from} → {target} is not supported")]
    UnsupportedConversion {
        from: DocumentFormat,
        target: DocumentFormat,
    },

    /// URL input was syntactically valid but the download failed.
    #[error("failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    // ── Resource limits (engine never invoked) ────────────────────────────
    /// Input exceeds the configured size bound.
    #[error("input of {size} bytes exceeds the configured limit of {limit} bytes")]
    ResourceLimit { size: u64, limit: u64 },

    // ── Engine invocation ─────────────────────────────────────────────────
    /// The engine did not complete within the configured timeout. The
    /// subprocess has been terminated and partial output discarded.
    #[error("engine did not complete within {secs}s")]
    Timeout { secs: u64 },

    /// The engine ran and reported failure. `diagnostic` preserves the
    /// stderr excerpt verbatim; `condition` is a magic-byte heuristic over
    /// the staged input (likely encrypted, likely corrupted, or unremarkable).
    #[error("engine failed (exit code {code:?}): {diagnostic}")]
    Engine {
        code: Option<i32>,
        diagnostic: String,
        condition: FileCondition,
    },

    /// The caller cancelled the request while the engine was in flight.
    /// The subprocess has been terminated.
    #[error("conversion cancelled by caller")]
    Cancelled,

    // ── Everything else ───────────────────────────────────────────────────
    /// Staging, temp-file or subprocess-launch failure unrelated to the
    /// document itself.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// Stable machine-readable error kind for the service boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::StartupFatal { .. } => "STARTUP_FATAL",
            ConvertError::FileNotFound { .. }
            | ConvertError::UnknownSourceFormat { .. }
            | ConvertError::UnsupportedConversion { .. }
            | ConvertError::DownloadFailed { .. } => "VALIDATION",
            ConvertError::ResourceLimit { .. } => "RESOURCE_LIMIT",
            ConvertError::Timeout { .. } => "TIMEOUT",
            ConvertError::Engine { .. } => "ENGINE",
            ConvertError::Cancelled => "CANCELLED",
            ConvertError::Io { .. } | ConvertError::Internal(_) => "INTERNAL",
        }
    }

    /// Convenience constructor for I/O failures with a context string.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ConvertError::Io {
            context: context.into(),
            source,
        }
    }
}
