//! The conversion-engine seam: a capability trait over an opaque executable.
//!
//! ## Why a trait?
//!
//! The engine is the one component this crate does not own. Binding it as
//! a trait keeps the request handler testable with mocks (invocation
//! counters, scripted failures, deliberate hangs) and lets deployments
//! substitute any conforming executable or in-process library without
//! touching the handler. The bundled binding, [`X2tEngine`], drives an
//! x2t-style converter: one task-config XML file in, one output file plus
//! an exit status out.
//!
//! ## Process discipline
//!
//! Every subprocess is spawned with `kill_on_drop`, so whoever drops the
//! in-flight future — the timeout wrapper, a fired [`CancelToken`], a
//! panicking caller — takes the child down with it. Nothing in this module
//! waits on a process it can no longer cancel.

use crate::config::ServiceConfig;
use crate::error::ConvertError;
use crate::format::DocumentFormat;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

#[cfg(not(windows))]
const X2T_BIN: &str = "x2t";
#[cfg(windows)]
const X2T_BIN: &str = "x2t.exe";

/// Cap on the stderr excerpt preserved in an engine failure. Diagnostics
/// below the cap are kept verbatim.
const STDERR_EXCERPT_MAX: usize = 4096;

// ── Job and outcome types ────────────────────────────────────────────────

/// One fully-resolved engine invocation: all paths are absolute and staged,
/// all formats validated, before this struct exists.
#[derive(Debug, Clone)]
pub struct EngineJob {
    /// Staged input document.
    pub input_path: PathBuf,
    /// Where the engine must write its output (inside the staging area;
    /// publication happens after the engine exits).
    pub output_path: PathBuf,
    pub source: DocumentFormat,
    pub target: DocumentFormat,
    /// Document password, forwarded to the engine when present.
    pub password: Option<String>,
}

/// What the engine reported. Launch failures (binary missing, spawn error)
/// are *not* outcomes — they surface as `Err(ConvertError::Io)` from
/// [`ConversionEngine::convert`].
#[derive(Debug)]
pub enum EngineOutcome {
    /// Zero exit and the output file exists.
    Success,
    /// Non-zero exit. `stderr` is the (capped) diagnostic excerpt,
    /// preserved verbatim.
    Failure { code: Option<i32>, stderr: String },
}

/// Capability interface over the opaque conversion executable.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    /// Run one conversion to completion. Cancellation is by dropping the
    /// returned future; implementations must not leave work running after
    /// a drop.
    async fn convert(&self, job: &EngineJob) -> Result<EngineOutcome, ConvertError>;

    /// Run the engine's cache-build mode (no document input). Called once
    /// during environment preparation, after font artifacts exist.
    async fn build_cache(&self) -> Result<EngineOutcome, ConvertError>;
}

// ── Exit-code table ──────────────────────────────────────────────────────

/// Human-readable message for a known engine exit code, if any.
///
/// The engine's conversion errors occupy 0x50–0x60 (80–96 decimal), with
/// 0x01 as the catch-all; the names behind these codes are the
/// `AVS_FILEUTILS_ERROR_CONVERT_*` constants. Unknown codes return `None`
/// and the caller falls back to the raw stderr.
pub fn describe_exit_code(code: i32) -> Option<&'static str> {
    match code {
        0x01 => Some("unknown error"),
        0x50 => Some("conversion failed"),
        0x51 => Some("failed to download the input"),
        0x52 => Some("unknown or unsupported input format"),
        0x53 => Some("conversion timed out inside the engine"),
        0x54 => Some("failed to read the input file"),
        0x55 => Some("unsupported DRM protection"),
        0x56 => Some("input file is corrupted"),
        0x57 => Some("external converter failure"),
        0x58 => Some("bad conversion parameters"),
        0x59 => Some("conversion requires additional parameters"),
        0x5a => Some("document is DRM protected"),
        0x5b => Some("document is password protected"),
        0x5c => Some("text encoding library failure"),
        0x5d => Some("document exceeds conversion limits"),
        0x5e => Some("spreadsheet exceeds the row limit"),
        0x5f => Some("failed to detect the input format"),
        0x60 => Some("spreadsheet exceeds the cell limit"),
        _ => None,
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// A cloneable cancellation token.
///
/// Built on a `tokio::sync::watch` channel rather than a notify flag so a
/// token fired *before* a waiter subscribes is still observed — the watch
/// value is level-triggered, not edge-triggered.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token. Idempotent; every clone observes it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token fires. Resolves immediately when already
    /// fired.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        // The sender lives inside `self`, so `changed` cannot error while
        // we are borrowed from it.
        let _ = rx.changed().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ── x2t binding ──────────────────────────────────────────────────────────

/// Subprocess binding for an x2t-style converter.
///
/// The engine takes exactly one argument, the path to a task-config XML
/// file naming the input, output, target format code, font directory and
/// theme directory. Everything else — format detection, filters, cache
/// lookup — happens inside the binary.
pub struct X2tEngine {
    engine_dir: PathBuf,
    /// Font directory handed to the engine; must match the directory the
    /// preparation stage generated the selection index into.
    font_dir: PathBuf,
    theme_dir: PathBuf,
}

impl X2tEngine {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            engine_dir: config.engine_dir.clone(),
            font_dir: config.font_source_dir.clone(),
            theme_dir: config.data_dir.join("themes"),
        }
    }

    fn binary_path(&self) -> PathBuf {
        self.engine_dir.join(X2T_BIN)
    }

    /// `LD_LIBRARY_PATH` with the engine directory prepended. Some engine
    /// builds dlopen their own shared objects relative to nothing.
    fn library_path(&self) -> String {
        let existing = std::env::var("LD_LIBRARY_PATH").unwrap_or_default();
        format!("{}:{}", self.engine_dir.display(), existing)
    }

    /// Render the task-config XML for one job.
    fn task_config(&self, job: &EngineJob) -> String {
        let mut params = String::new();
        if let Some(ref pwd) = job.password {
            params.push_str(&format!(
                "  <m_sPassword>{}</m_sPassword>\n",
                xml_escape(pwd)
            ));
        }
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <TaskQueueDataConvert xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"\n\
             \x20                     xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\">\n\
             \x20 <m_sFileFrom>{}</m_sFileFrom>\n\
             \x20 <m_sFileTo>{}</m_sFileTo>\n\
             \x20 <m_sFontDir>{}</m_sFontDir>\n\
             \x20 <m_sThemeDir>{}</m_sThemeDir>\n\
             \x20 <m_nFormatTo>{}</m_nFormatTo>\n\
             {}</TaskQueueDataConvert>\n",
            xml_escape(&job.input_path.display().to_string()),
            xml_escape(&job.output_path.display().to_string()),
            xml_escape(&self.font_dir.display().to_string()),
            xml_escape(&self.theme_dir.display().to_string()),
            job.target.engine_code(),
            params,
        )
    }

    async fn run(&self, args: &[String]) -> Result<EngineOutcome, ConvertError> {
        let binary = self.binary_path();
        debug!(binary = %binary.display(), ?args, "invoking engine");

        let output = Command::new(&binary)
            .args(args)
            .env("LD_LIBRARY_PATH", self.library_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConvertError::io(format!("failed to launch '{}'", binary.display()), e))?;

        if output.status.success() {
            return Ok(EngineOutcome::Success);
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.len() > STDERR_EXCERPT_MAX {
            stderr.truncate(
                (0..=STDERR_EXCERPT_MAX)
                    .rev()
                    .find(|&i| stderr.is_char_boundary(i))
                    .unwrap_or(0),
            );
        }
        Ok(EngineOutcome::Failure {
            code: output.status.code(),
            stderr,
        })
    }
}

#[async_trait]
impl ConversionEngine for X2tEngine {
    async fn convert(&self, job: &EngineJob) -> Result<EngineOutcome, ConvertError> {
        // The config file sits beside the staged input, inside the
        // per-request directory, so request cleanup removes it too.
        let config_path = job
            .input_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("task.xml");

        tokio::fs::write(&config_path, self.task_config(job))
            .await
            .map_err(|e| ConvertError::io("failed to write engine task config", e))?;

        self.run(&[config_path.display().to_string()]).await
    }

    async fn build_cache(&self) -> Result<EngineOutcome, ConvertError> {
        let outcome = self
            .run(&[
                "--build-cache".to_string(),
                format!("--fonts-dir={}", self.font_dir.display()),
            ])
            .await?;
        if let EngineOutcome::Failure { code, ref stderr } = outcome {
            warn!(?code, stderr, "engine cache build reported failure");
        }
        Ok(outcome)
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
