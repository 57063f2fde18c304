//! The conversion request handler: validate, stage, invoke, publish.
//!
//! Every request moves through the same pipeline regardless of where the
//! input comes from or where the output goes:
//!
//! 1. **Resolve** the input into bytes on disk inside a per-request
//!    staging directory (local copy, in-memory write, or bounded
//!    download).
//! 2. **Validate** the size limit and the (source → target) pair against
//!    the conversion matrix. Both checks run before the engine, so a
//!    doomed request never consumes a conversion slot.
//! 3. **Invoke** the engine under a timeout, optionally racing a
//!    [`CancelToken`].
//! 4. **Publish** the output atomically (rename into place) or read it
//!    into memory, then tear down the staging directory.
//!
//! The staging directory is a [`tempfile::TempDir`]: it is removed when
//! the request future completes *or is dropped*, so timeouts, cancels and
//! panics all clean up the same way the happy path does. Concurrent
//! requests never share paths — every staging directory and every staged
//! file name embeds a fresh UUID.

use crate::config::ServiceConfig;
use crate::engine::{describe_exit_code, CancelToken, ConversionEngine, EngineJob, EngineOutcome};
use crate::error::ConvertError;
use crate::format::DocumentFormat;
use crate::sniff::{file_condition, FileCondition};
use futures::StreamExt;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Bytes sniffed from the staged input for condition heuristics.
const SNIFF_PREFIX_LEN: usize = 64;

/// Shared HTTP client for URL inputs. Connection pooling across requests
/// is the point; per-request timeouts are applied at the call site.
static HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

// ── Request and artifact types ───────────────────────────────────────────

/// Where the input document comes from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// A file already on local disk. Copied into staging, never modified.
    Path(PathBuf),
    /// Raw document bytes supplied by the caller.
    Bytes(Vec<u8>),
    /// An http(s) URL, downloaded with the configured timeout and the
    /// size limit enforced mid-stream.
    Url(String),
}

/// Where the output document goes.
#[derive(Debug, Clone)]
pub enum OutputTarget {
    /// Publish to this path via an atomic rename.
    File(PathBuf),
    /// Return the bytes in the [`ConversionArtifact`].
    Memory,
}

/// One conversion request.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: InputSource,
    /// Declared source format. When `None` the handler infers it from the
    /// file extension, then from leading bytes, and rejects the request if
    /// both fail.
    pub source: Option<DocumentFormat>,
    pub target: DocumentFormat,
    pub output: OutputTarget,
    /// Password for protected documents, forwarded to the engine.
    pub password: Option<String>,
}

impl ConversionRequest {
    /// Convert a local file, inferring the source format.
    pub fn file_to_file(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        target: DocumentFormat,
    ) -> Self {
        Self {
            input: InputSource::Path(input.into()),
            source: None,
            target,
            output: OutputTarget::File(output.into()),
            password: None,
        }
    }

    /// Convert in-memory bytes and return the result in memory.
    pub fn bytes_to_memory(
        bytes: Vec<u8>,
        source: DocumentFormat,
        target: DocumentFormat,
    ) -> Self {
        Self {
            input: InputSource::Bytes(bytes),
            source: Some(source),
            target,
            output: OutputTarget::Memory,
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn input_label(&self) -> String {
        match &self.input {
            InputSource::Path(p) => p.display().to_string(),
            InputSource::Bytes(b) => format!("<{} bytes in memory>", b.len()),
            InputSource::Url(u) => u.clone(),
        }
    }
}

/// Where a finished conversion's bytes ended up.
#[derive(Debug)]
pub enum ArtifactPayload {
    /// Published to this path (the request's `OutputTarget::File`).
    File(PathBuf),
    Memory(Vec<u8>),
}

/// A completed conversion.
#[derive(Debug)]
pub struct ConversionArtifact {
    pub format: DocumentFormat,
    /// MIME type of the output, derived from the target format.
    pub content_type: &'static str,
    pub payload: ArtifactPayload,
    /// Wall time spent inside the engine, excluding staging and publish.
    pub engine_time: Duration,
}

// ── The service ──────────────────────────────────────────────────────────

/// The conversion request handler. Cheap to clone; all clones share the
/// configuration and the engine.
#[derive(Clone)]
pub struct ConversionService {
    config: Arc<ServiceConfig>,
    engine: Arc<dyn ConversionEngine>,
}

impl ConversionService {
    pub fn new(config: Arc<ServiceConfig>, engine: Arc<dyn ConversionEngine>) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run one conversion to completion.
    pub async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionArtifact, ConvertError> {
        self.convert_inner(request, None).await
    }

    /// Run one conversion, aborting early if `cancel` fires. A fired token
    /// terminates the engine subprocess and returns
    /// [`ConvertError::Cancelled`]; the staging directory is removed either
    /// way.
    pub async fn convert_with_cancel(
        &self,
        request: ConversionRequest,
        cancel: &CancelToken,
    ) -> Result<ConversionArtifact, ConvertError> {
        self.convert_inner(request, Some(cancel)).await
    }

    /// Run a batch with at most `concurrency` conversions in flight.
    /// Results come back in request order; one failure does not abort the
    /// rest.
    pub async fn convert_many(
        &self,
        requests: Vec<ConversionRequest>,
        concurrency: usize,
    ) -> Vec<Result<ConversionArtifact, ConvertError>> {
        futures::stream::iter(requests)
            .map(|request| self.convert(request))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    #[instrument(
        skip_all,
        fields(target = %request.target, input = %request.input_label())
    )]
    async fn convert_inner(
        &self,
        request: ConversionRequest,
        cancel: Option<&CancelToken>,
    ) -> Result<ConversionArtifact, ConvertError> {
        let staging = self.staging_dir().await?;
        let request_id = Uuid::new_v4();

        // Resolve the input into a staged file. The source format may not
        // be known yet, so the staged name carries the extension only when
        // it is.
        let staged_input = self
            .stage_input(&request, staging.path(), request_id)
            .await?;

        let source = self.resolve_source(&request, &staged_input).await?;
        if !source.can_convert_to(request.target) {
            return Err(ConvertError::UnsupportedConversion {
                from: source,
                target: request.target,
            });
        }

        let output_path = staging
            .path()
            .join(format!("{request_id}-out.{}", request.target.extension()));
        let job = EngineJob {
            input_path: staged_input.clone(),
            output_path: output_path.clone(),
            source,
            target: request.target,
            password: request.password.clone(),
        };

        debug!(%source, "invoking engine");
        let started = Instant::now();
        let outcome = self.run_engine(&job, cancel).await?;
        let engine_time = started.elapsed();

        match outcome {
            EngineOutcome::Success => {}
            EngineOutcome::Failure { code, stderr } => {
                return Err(self.engine_error(code, stderr, &staged_input, source).await);
            }
        }

        // The engine exited zero; hold it to its word before publishing.
        let out_meta = tokio::fs::metadata(&output_path).await.map_err(|_| {
            ConvertError::Internal("engine reported success but produced no output".into())
        })?;
        if out_meta.len() == 0 {
            return Err(ConvertError::Internal(
                "engine reported success but produced an empty output".into(),
            ));
        }

        let payload = match request.output {
            OutputTarget::Memory => {
                let bytes = tokio::fs::read(&output_path)
                    .await
                    .map_err(|e| ConvertError::io("failed to read converted output", e))?;
                ArtifactPayload::Memory(bytes)
            }
            OutputTarget::File(dest) => {
                publish(&output_path, &dest).await?;
                ArtifactPayload::File(dest)
            }
        };

        info!(
            %source,
            target = %request.target,
            engine_ms = engine_time.as_millis() as u64,
            "conversion complete"
        );
        Ok(ConversionArtifact {
            format: request.target,
            content_type: request.target.content_type(),
            payload,
            engine_time,
        })
        // `staging` drops here; the per-request directory disappears on
        // success and on every early return above alike.
    }

    /// Create the per-request staging directory under the configured work
    /// root.
    async fn staging_dir(&self) -> Result<TempDir, ConvertError> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| ConvertError::io("failed to create work directory", e))?;
        tempfile::Builder::new()
            .prefix("req-")
            .tempdir_in(&self.config.work_dir)
            .map_err(|e| ConvertError::io("failed to create staging directory", e))
    }

    /// Materialise the request input as a file inside `staging`, enforcing
    /// the size limit before (files, bytes) or during (downloads) the
    /// write.
    async fn stage_input(
        &self,
        request: &ConversionRequest,
        staging: &Path,
        request_id: Uuid,
    ) -> Result<PathBuf, ConvertError> {
        let limit = self.config.max_input_size_bytes;
        let staged_name = |ext: Option<&str>| match ext {
            Some(ext) => staging.join(format!("{request_id}-in.{ext}")),
            None => staging.join(format!("{request_id}-in")),
        };

        match &request.input {
            InputSource::Path(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|_| ConvertError::FileNotFound { path: path.clone() })?;
                if meta.len() > limit {
                    return Err(ConvertError::ResourceLimit {
                        size: meta.len(),
                        limit,
                    });
                }
                let ext = path.extension().and_then(|e| e.to_str());
                let staged = staged_name(ext);
                tokio::fs::copy(path, &staged)
                    .await
                    .map_err(|e| ConvertError::io("failed to stage input file", e))?;
                Ok(staged)
            }
            InputSource::Bytes(bytes) => {
                if bytes.len() as u64 > limit {
                    return Err(ConvertError::ResourceLimit {
                        size: bytes.len() as u64,
                        limit,
                    });
                }
                let ext = request.source.map(|f| f.extension());
                let staged = staged_name(ext);
                tokio::fs::write(&staged, bytes)
                    .await
                    .map_err(|e| ConvertError::io("failed to stage input bytes", e))?;
                Ok(staged)
            }
            InputSource::Url(url) => {
                let staged = staged_name(url_extension(url));
                self.download(url, &staged, limit).await?;
                Ok(staged)
            }
        }
    }

    /// Stream a URL to `dest`, failing fast once `limit` bytes have been
    /// written. The Content-Length header is checked first when present,
    /// but the stream is counted regardless; headers lie.
    async fn download(&self, url: &str, dest: &Path, limit: u64) -> Result<(), ConvertError> {
        let failed = |reason: String| ConvertError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = HTTP
            .get(url)
            .timeout(self.config.download_timeout())
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("server returned {}", response.status())));
        }
        if let Some(len) = response.content_length() {
            if len > limit {
                return Err(ConvertError::ResourceLimit { size: len, limit });
            }
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ConvertError::io("failed to create staged download", e))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(ConvertError::ResourceLimit {
                    size: written,
                    limit,
                });
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(|e| ConvertError::io("failed to write staged download", e))?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| ConvertError::io("failed to flush staged download", e))?;

        if written == 0 {
            return Err(failed("empty response body".into()));
        }
        debug!(bytes = written, "download staged");
        Ok(())
    }

    /// Settle the source format: declaration wins, then the staged file's
    /// extension, then leading-byte sniffing.
    async fn resolve_source(
        &self,
        request: &ConversionRequest,
        staged_input: &Path,
    ) -> Result<DocumentFormat, ConvertError> {
        if let Some(declared) = request.source {
            return Ok(declared);
        }
        if let Some(from_ext) = staged_input
            .extension()
            .and_then(|e| e.to_str())
            .and_then(DocumentFormat::from_extension)
        {
            return Ok(from_ext);
        }
        let prefix = read_prefix(staged_input).await;
        DocumentFormat::from_magic(&prefix).ok_or_else(|| ConvertError::UnknownSourceFormat {
            input: request.input_label(),
        })
    }

    /// Invoke the engine under the configured timeout, racing the cancel
    /// token when one is supplied. Dropping the engine future kills the
    /// subprocess, so both exits leave nothing running.
    async fn run_engine(
        &self,
        job: &EngineJob,
        cancel: Option<&CancelToken>,
    ) -> Result<EngineOutcome, ConvertError> {
        let timeout = self.config.engine_timeout();
        let bounded = tokio::time::timeout(timeout, self.engine.convert(job));

        let timed_out = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        warn!("conversion cancelled by caller");
                        return Err(ConvertError::Cancelled);
                    }
                    result = bounded => result,
                }
            }
            None => bounded.await,
        };

        match timed_out {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(secs = timeout.as_secs(), "engine timed out");
                Err(ConvertError::Timeout {
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Turn an engine failure into the richest error we can: known exit
    /// codes get the table message, a `std::out_of_range` abort is the
    /// engine's way of choking on an encrypted document, and the staged
    /// bytes are sniffed for a container verdict.
    async fn engine_error(
        &self,
        code: Option<i32>,
        stderr: String,
        staged_input: &Path,
        source: DocumentFormat,
    ) -> ConvertError {
        let prefix = read_prefix(staged_input).await;
        let mut condition = file_condition(&prefix, source);

        // The engine aborts with this exception text when it walks into an
        // encrypted container it cannot open.
        if stderr.contains("std::out_of_range") {
            condition = FileCondition::LikelyEncrypted;
        }

        let diagnostic = match code.and_then(describe_exit_code) {
            Some(message) if stderr.trim().is_empty() => message.to_string(),
            Some(message) => format!("{message}: {}", stderr.trim()),
            None => stderr.trim().to_string(),
        };

        warn!(?code, ?condition, "engine failed");
        ConvertError::Engine {
            code,
            diagnostic,
            condition,
        }
    }
}

/// Move the finished output into place. Rename is atomic on the same
/// filesystem; when the destination lives elsewhere (EXDEV), fall back to
/// [`publish_via_copy`].
async fn publish(from: &Path, to: &Path) -> Result<(), ConvertError> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConvertError::io("failed to create output directory", e))?;
        }
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    publish_via_copy(from, to).await
}

/// Cross-filesystem publish: copy to a hidden sibling of the destination,
/// then rename into place. The final path only ever holds a complete
/// file; a reader polling it never sees a half-written artifact.
async fn publish_via_copy(from: &Path, to: &Path) -> Result<(), ConvertError> {
    let parent = to
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let scratch = parent.join(format!(".{}.partial", Uuid::new_v4()));

    tokio::fs::copy(from, &scratch)
        .await
        .map_err(|e| ConvertError::io("failed to publish converted output", e))?;
    if let Err(e) = tokio::fs::rename(&scratch, to).await {
        let _ = tokio::fs::remove_file(&scratch).await;
        return Err(ConvertError::io("failed to publish converted output", e));
    }
    let _ = tokio::fs::remove_file(from).await;
    Ok(())
}

/// Recognised file extension from a URL's path component. Query strings
/// and fragments are stripped first; signed URLs routinely carry both.
fn url_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|leaf| leaf.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| DocumentFormat::from_extension(ext).is_some())
}

/// First bytes of a staged file, best effort. Sniffing is advisory; an
/// unreadable file just yields an empty prefix.
async fn read_prefix(path: &Path) -> Vec<u8> {
    match tokio::fs::read(path).await {
        Ok(mut bytes) => {
            bytes.truncate(SNIFF_PREFIX_LEN);
            bytes
        }
        Err(_) => Vec::new(),
    }
}
