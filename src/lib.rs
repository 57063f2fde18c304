//! # convertd
//!
//! An office-document conversion core built around an opaque external
//! conversion engine. The crate does not parse or render documents itself;
//! it prepares the engine's environment once, then handles concurrent
//! conversion requests with validation, staging isolation, timeouts and
//! structured errors.
//!
//! ## Two halves
//!
//! * **Environment preparation** ([`PreparationStage`]) — a one-time,
//!   strictly ordered cold-start sequence: generate font artifacts, render
//!   presentation theme previews, warm the engine's font cache. Font and
//!   theme failures are fatal; a cold cache only costs latency.
//!
//! * **Request handling** ([`ConversionService`]) — validate the request
//!   (format matrix, size limit), stage the input in a throwaway
//!   per-request directory, invoke the engine under a timeout, publish the
//!   output atomically. Inputs can be local files, in-memory bytes or
//!   URLs; outputs can be files or bytes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use convertd::{
//!     ConversionRequest, ConversionService, DocumentFormat, PreparationStage, ServiceConfig,
//!     X2tEngine,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), convertd::ConvertError> {
//! let config = Arc::new(ServiceConfig::from_env()?);
//! let engine = Arc::new(X2tEngine::new(&config));
//!
//! // Once, before serving requests.
//! PreparationStage::new(config.clone()).run(engine.as_ref()).await?;
//!
//! let service = ConversionService::new(config, engine);
//! let artifact = service
//!     .convert(ConversionRequest::file_to_file(
//!         "report.docx",
//!         "report.pdf",
//!         DocumentFormat::Pdf,
//!     ))
//!     .await?;
//! println!("wrote {} output", artifact.content_type);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod format;
pub mod prepare;
pub mod sniff;

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use convert::{
    ArtifactPayload, ConversionArtifact, ConversionRequest, ConversionService, InputSource,
    OutputTarget,
};
pub use engine::{CancelToken, ConversionEngine, EngineJob, EngineOutcome, X2tEngine};
pub use error::ConvertError;
pub use format::{DocumentFormat, FormatFamily};
pub use prepare::{FontSet, PreparationStage, PreparedEnvironment};
pub use sniff::FileCondition;
