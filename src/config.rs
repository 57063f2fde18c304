//! Service configuration, resolved once at startup and immutable afterwards.
//!
//! Every knob lives in one struct so it can be shared across request
//! handlers behind an `Arc`, serialised into startup logs, and diffed
//! between two deployments to explain behavioural differences. Built via
//! [`ServiceConfigBuilder`] or resolved from environment variables with
//! [`ServiceConfig::from_env`]; nothing reads the environment after
//! startup.

use crate::error::ConvertError;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default engine install directory on a stock document-server layout.
const DEFAULT_ENGINE_DIR: &str = "/var/www/onlyoffice/documentserver/server/FileConverter/bin";
/// Default preparation-tool directory (font/theme generators).
const DEFAULT_TOOL_DIR: &str = "/var/www/onlyoffice/documentserver/server/tools";
/// Default custom-font source directory.
const DEFAULT_FONT_DIR: &str = "/var/www/onlyoffice/documentserver/fonts";
/// Default presentation-theme source directory.
const DEFAULT_THEME_DIR: &str = "/var/www/onlyoffice/documentserver/sdkjs/slide/themes";

/// Configuration for the conversion service.
///
/// # Example
/// ```rust
/// use convertd::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .max_input_size_bytes(1024 * 1024)
///     .engine_timeout_secs(30)
///     .build()
///     .unwrap();
/// assert_eq!(config.engine_timeout().as_secs(), 30);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ServiceConfig {
    /// Directory containing the conversion-engine binary and its shared
    /// objects. The directory is also prepended to `LD_LIBRARY_PATH` for
    /// every engine invocation; some engine builds fail to locate their
    /// own libraries without it.
    pub engine_dir: PathBuf,

    /// Directory containing the preparation tools (font-manifest generator
    /// and theme renderer).
    pub tool_dir: PathBuf,

    /// Directory scanned for custom fonts at preparation time. May be
    /// empty; the generator then runs against system fonts only.
    pub font_source_dir: PathBuf,

    /// Directory containing presentation theme sources.
    pub theme_source_dir: PathBuf,

    /// Root for generated artifacts (font manifests, glyph images, web
    /// fonts, theme previews). Written during preparation, read-only
    /// afterwards.
    pub data_dir: PathBuf,

    /// Root for per-request staging directories. Each request gets its own
    /// subdirectory named by a fresh UUID; nothing here survives a request.
    pub work_dir: PathBuf,

    /// Maximum accepted input size in bytes. Default: 100 MiB.
    ///
    /// Checked before the engine is invoked, so an oversized upload costs
    /// a `stat` call, not a conversion slot.
    pub max_input_size_bytes: u64,

    /// Engine invocation timeout in seconds. Default: 120.
    ///
    /// Conversions that legitimately run longer than this are pathological
    /// for interactive callers; batch deployments should raise it rather
    /// than remove it — an unbounded engine hang pins a staging directory
    /// and a subprocess forever.
    pub engine_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Pass `--use-system=true` to the font generator. Default: true.
    pub use_system_fonts: bool,

    /// Pass `--use-system-user=true` to the font generator. Default: false.
    ///
    /// Off by default because a service account's `~/.fonts` is almost
    /// never intentional input in a server deployment.
    pub use_system_user_fonts: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            engine_dir: PathBuf::from(DEFAULT_ENGINE_DIR),
            tool_dir: PathBuf::from(DEFAULT_TOOL_DIR),
            font_source_dir: PathBuf::from(DEFAULT_FONT_DIR),
            theme_source_dir: PathBuf::from(DEFAULT_THEME_DIR),
            data_dir: PathBuf::from("/var/lib/convertd/data"),
            work_dir: std::env::temp_dir().join("convertd"),
            max_input_size_bytes: 100 * 1024 * 1024,
            engine_timeout_secs: 120,
            download_timeout_secs: 120,
            use_system_fonts: true,
            use_system_user_fonts: false,
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Resolve configuration from `CONVERTD_*` environment variables,
    /// falling back to the documented defaults.
    ///
    /// `X2T_PATH` and `X2T_FONTS_PATH` are honoured as aliases for the
    /// engine and font directories; existing deployments set them.
    pub fn from_env() -> Result<ServiceConfig, ConvertError> {
        let mut b = Self::builder();

        if let Some(dir) = env_path("CONVERTD_ENGINE_DIR").or_else(|| env_path("X2T_PATH")) {
            b = b.engine_dir(dir);
        }
        if let Some(dir) = env_path("CONVERTD_TOOL_DIR") {
            b = b.tool_dir(dir);
        }
        if let Some(dir) = env_path("CONVERTD_FONT_DIR").or_else(|| env_path("X2T_FONTS_PATH")) {
            b = b.font_source_dir(dir);
        }
        if let Some(dir) = env_path("CONVERTD_THEME_DIR") {
            b = b.theme_source_dir(dir);
        }
        if let Some(dir) = env_path("CONVERTD_DATA_DIR") {
            b = b.data_dir(dir);
        }
        if let Some(dir) = env_path("CONVERTD_WORK_DIR") {
            b = b.work_dir(dir);
        }
        if let Some(n) = env_u64("CONVERTD_MAX_INPUT_SIZE")? {
            b = b.max_input_size_bytes(n);
        }
        if let Some(n) = env_u64("CONVERTD_ENGINE_TIMEOUT")? {
            b = b.engine_timeout_secs(n);
        }
        if let Some(n) = env_u64("CONVERTD_DOWNLOAD_TIMEOUT")? {
            b = b.download_timeout_secs(n);
        }
        if let Some(v) = env_bool("CONVERTD_USE_SYSTEM_FONTS")? {
            b = b.use_system_fonts(v);
        }
        if let Some(v) = env_bool("CONVERTD_USE_SYSTEM_USER_FONTS")? {
            b = b.use_system_user_fonts(v);
        }

        b.build()
    }

    /// Engine invocation timeout as a [`Duration`].
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    /// URL-input download timeout as a [`Duration`].
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn engine_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.engine_dir = dir.into();
        self
    }

    pub fn tool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tool_dir = dir.into();
        self
    }

    pub fn font_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.font_source_dir = dir.into();
        self
    }

    pub fn theme_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.theme_source_dir = dir.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn max_input_size_bytes(mut self, n: u64) -> Self {
        self.config.max_input_size_bytes = n;
        self
    }

    pub fn engine_timeout_secs(mut self, secs: u64) -> Self {
        self.config.engine_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn use_system_fonts(mut self, v: bool) -> Self {
        self.config.use_system_fonts = v;
        self
    }

    pub fn use_system_user_fonts(mut self, v: bool) -> Self {
        self.config.use_system_user_fonts = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ConvertError> {
        let c = &self.config;
        if c.max_input_size_bytes == 0 {
            return Err(ConvertError::Internal(
                "max_input_size_bytes must be ≥ 1".into(),
            ));
        }
        if c.engine_timeout_secs == 0 {
            return Err(ConvertError::Internal(
                "engine_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Env helpers ──────────────────────────────────────────────────────────

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_u64(key: &str) -> Result<Option<u64>, ConvertError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConvertError::Internal(format!("{key} is not a valid integer: '{v}'"))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConvertError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => match v.as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            other => Err(ConvertError::Internal(format!(
                "{key} is not a valid boolean: '{other}'"
            ))),
        },
        _ => Ok(None),
    }
}
