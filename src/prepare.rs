//! Environment Preparation Stage: the cold-start work that must finish
//! before the first conversion request is served.
//!
//! Three steps, strictly ordered:
//!
//! 1. **Font artifacts** — scan the custom-font directory, then run the
//!    font-manifest generator (web manifest, engine-native selection
//!    index, glyph images, web fonts).
//! 2. **Theme artifacts** — render presentation theme previews, once per
//!    variant (default plus two mobile variants at fixed dimensions).
//! 3. **Cache warm** — ask the engine to build its font-metric cache.
//!
//! Steps 2 and 3 both read the manifest written by step 1, which is why
//! the ordering is enforced in code rather than documented. Steps 1 and 2
//! are fatal on failure (there is no fallback manifest or theme to serve
//! with); step 3 only costs first-request latency and is downgraded to a
//! warning.
//!
//! The whole stage is idempotent: the generators are deterministic over
//! identical inputs, so re-running on restart overwrites artifacts with
//! byte-identical content and needs no deduplication logic.

use crate::config::ServiceConfig;
use crate::engine::{ConversionEngine, EngineOutcome};
use crate::error::ConvertError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(not(windows))]
const FONT_GEN_BIN: &str = "allfontsgen";
#[cfg(windows)]
const FONT_GEN_BIN: &str = "allfontsgen.exe";

#[cfg(not(windows))]
const THEME_GEN_BIN: &str = "allthemesgen";
#[cfg(windows)]
const THEME_GEN_BIN: &str = "allthemesgen.exe";

/// Font file extensions the scanner considers.
const FONT_EXTENSIONS: [&str; 3] = ["ttf", "otf", "ttc"];

// ── Font model ───────────────────────────────────────────────────────────

/// One discovered font file with the metadata the manifest will carry.
#[derive(Debug, Clone)]
pub struct FontFace {
    pub path: PathBuf,
    /// Family name from the font's name table; `None` when the file could
    /// not be parsed (it is still listed — the generator may understand
    /// formats this scanner does not).
    pub family: Option<String>,
    /// OS/2 weight class (400 = regular, 700 = bold).
    pub weight: u16,
    pub italic: bool,
}

/// Ordered collection of font files discovered from a directory.
///
/// Ordering is by path, so two scans of the same tree produce identical
/// sets — a precondition for the preparation stage's idempotence claim.
#[derive(Debug, Clone, Default)]
pub struct FontSet {
    faces: Vec<FontFace>,
}

impl FontSet {
    /// Recursively scan `dir` for font files. A missing or empty directory
    /// yields an empty set, which is legal: the generator then runs
    /// against system fonts only.
    pub fn scan(dir: &Path) -> Self {
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&d) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| FONT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        let faces = paths
            .into_iter()
            .map(|path| match read_face_metadata(&path) {
                Some((family, weight, italic)) => FontFace {
                    path,
                    family: Some(family),
                    weight,
                    italic,
                },
                None => {
                    debug!(path = %path.display(), "could not parse font metadata");
                    FontFace {
                        path,
                        family: None,
                        weight: 400,
                        italic: false,
                    }
                }
            })
            .collect();

        Self { faces }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn faces(&self) -> &[FontFace] {
        &self.faces
    }

    /// Check the manifest invariant: every scanned file still exists on
    /// disk. Returns the first missing path, if any.
    pub fn first_missing(&self) -> Option<&Path> {
        self.faces
            .iter()
            .map(|f| f.path.as_path())
            .find(|p| !p.exists())
    }
}

/// Family name, weight and italic flag from a font file's first face.
fn read_face_metadata(path: &Path) -> Option<(String, u16, bool)> {
    let data = std::fs::read(path).ok()?;
    let face = ttf_parser::Face::parse(&data, 0).ok()?;
    let family = face.names().into_iter().find_map(|name| {
        (name.name_id == ttf_parser::name_id::FAMILY && name.is_unicode())
            .then(|| name.to_string())
            .flatten()
    })?;
    Some((family, face.weight().to_number(), face.is_italic()))
}

// ── Artifact layout ──────────────────────────────────────────────────────

/// Where the font generator writes, all under `data_dir/fonts`.
#[derive(Debug, Clone)]
pub struct FontArtifactPaths {
    /// Web-consumable manifest (consumed by editor frontends).
    pub web_manifest: PathBuf,
    /// Engine-native font-selection index.
    pub engine_manifest: PathBuf,
    /// Rendered glyph/sample images.
    pub image_dir: PathBuf,
    /// Converted web-font files.
    pub web_font_dir: PathBuf,
}

impl FontArtifactPaths {
    pub fn under(data_dir: &Path) -> Self {
        let fonts = data_dir.join("fonts");
        Self {
            web_manifest: fonts.join("allfonts.js"),
            engine_manifest: fonts.join("font_selection.bin"),
            image_dir: fonts.join("images"),
            web_font_dir: fonts.join("web"),
        }
    }
}

/// One theme-rendering variant. The set is fixed: default, plus two
/// mobile variants whose dimensions match what mobile editors request.
#[derive(Debug, Clone, Copy)]
pub struct ThemeVariant {
    pub postfix: Option<&'static str>,
    pub dimensions: Option<(u32, u32)>,
}

impl ThemeVariant {
    pub const ALL: [ThemeVariant; 3] = [
        ThemeVariant {
            postfix: None,
            dimensions: None,
        },
        ThemeVariant {
            postfix: Some("ios"),
            dimensions: Some((280, 224)),
        },
        ThemeVariant {
            postfix: Some("android"),
            dimensions: Some((264, 176)),
        },
    ];

    fn label(&self) -> &'static str {
        self.postfix.unwrap_or("default")
    }
}

/// The read-only product of a completed preparation run. Handed to request
/// handlers behind an `Arc`; nothing mutates it afterwards.
#[derive(Debug)]
pub struct PreparedEnvironment {
    pub fonts: FontSet,
    pub font_artifacts: FontArtifactPaths,
    pub theme_dir: PathBuf,
    /// Whether the engine cache warm succeeded. Informational only.
    pub cache_warmed: bool,
}

// ── The stage ────────────────────────────────────────────────────────────

/// Runs the preparation steps in order. Single-threaded and sequential by
/// design — this blocks request serving, it does not race it.
pub struct PreparationStage {
    config: Arc<ServiceConfig>,
}

impl PreparationStage {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self { config }
    }

    /// Run fonts → themes → cache warm. Any font or theme failure aborts
    /// with [`ConvertError::StartupFatal`]; a cache-warm failure is logged
    /// and recorded on the returned environment.
    pub async fn run(
        &self,
        engine: &dyn ConversionEngine,
    ) -> Result<PreparedEnvironment, ConvertError> {
        let (fonts, font_artifacts) = self.generate_font_artifacts().await?;
        let theme_dir = self.generate_theme_artifacts().await?;
        let cache_warmed = self.warm_conversion_cache(engine).await;

        info!(
            fonts = fonts.len(),
            cache_warmed, "environment preparation complete"
        );
        Ok(PreparedEnvironment {
            fonts,
            font_artifacts,
            theme_dir,
            cache_warmed,
        })
    }

    /// Step 3: ask the engine to build its font-metric cache. A cold
    /// cache only costs first-request latency, so failure is a warning,
    /// never an error.
    pub async fn warm_conversion_cache(&self, engine: &dyn ConversionEngine) -> bool {
        match engine.build_cache().await {
            Ok(EngineOutcome::Success) => true,
            Ok(EngineOutcome::Failure { code, stderr }) => {
                warn!(?code, stderr, "cache warm failed; first conversions will be slower");
                false
            }
            Err(e) => {
                warn!(error = %e, "cache warm could not be invoked; first conversions will be slower");
                false
            }
        }
    }

    /// Step 1: scan fonts and run the manifest generator.
    pub async fn generate_font_artifacts(
        &self,
    ) -> Result<(FontSet, FontArtifactPaths), ConvertError> {
        let cfg = &self.config;
        let fonts = FontSet::scan(&cfg.font_source_dir);

        // Zero custom fonts is legal, but only if the generator may fall
        // back to system fonts.
        let use_system = cfg.use_system_fonts || fonts.is_empty();
        if fonts.is_empty() {
            info!(
                dir = %cfg.font_source_dir.display(),
                "no custom fonts found; generating from system fonts only"
            );
        } else {
            info!(dir = %cfg.font_source_dir.display(), count = fonts.len(), "scanned custom fonts");
        }

        let paths = FontArtifactPaths::under(&cfg.data_dir);
        for dir in [&paths.image_dir, &paths.web_font_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ConvertError::StartupFatal {
                    stage: "font artifact generation",
                    detail: format!("cannot create '{}': {e}", dir.display()),
                }
            })?;
        }

        let args = vec![
            format!("--input={}", cfg.font_source_dir.display()),
            format!("--allfonts-web={}", paths.web_manifest.display()),
            format!("--selection={}", paths.engine_manifest.display()),
            format!("--images={}", paths.image_dir.display()),
            format!("--output-web={}", paths.web_font_dir.display()),
            format!("--use-system={}", use_system),
            format!("--use-system-user={}", cfg.use_system_user_fonts),
        ];
        run_tool(
            &cfg.tool_dir.join(FONT_GEN_BIN),
            &args,
            "font artifact generation",
        )
        .await?;

        // Manifest invariant: the declared outputs exist and are non-empty,
        // and every scanned font file is still on disk.
        for out in [&paths.web_manifest, &paths.engine_manifest] {
            let meta = tokio::fs::metadata(out)
                .await
                .map_err(|e| ConvertError::StartupFatal {
                    stage: "font artifact generation",
                    detail: format!("generator did not produce '{}': {e}", out.display()),
                })?;
            if meta.len() == 0 {
                return Err(ConvertError::StartupFatal {
                    stage: "font artifact generation",
                    detail: format!("generator produced empty '{}'", out.display()),
                });
            }
        }
        if let Some(missing) = fonts.first_missing() {
            return Err(ConvertError::StartupFatal {
                stage: "font artifact generation",
                detail: format!("font file vanished during preparation: '{}'", missing.display()),
            });
        }

        Ok((fonts, paths))
    }

    /// Step 2: render theme previews, one generator run per variant.
    ///
    /// Variants are independent and order-insensitive; every variant is
    /// attempted even after one fails, and all failures are reported
    /// together.
    pub async fn generate_theme_artifacts(&self) -> Result<PathBuf, ConvertError> {
        let cfg = &self.config;
        let output_dir = cfg.data_dir.join("themes");
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            ConvertError::StartupFatal {
                stage: "theme artifact generation",
                detail: format!("cannot create '{}': {e}", output_dir.display()),
            }
        })?;

        let tool = cfg.tool_dir.join(THEME_GEN_BIN);
        let mut failures: Vec<String> = Vec::new();

        for variant in ThemeVariant::ALL {
            let mut args = vec![
                format!("--converter-dir={}", cfg.engine_dir.display()),
                format!("--src={}", cfg.theme_source_dir.display()),
                format!("--output={}", output_dir.display()),
            ];
            if let Some(postfix) = variant.postfix {
                args.push(format!("--postfix={postfix}"));
            }
            if let Some((w, h)) = variant.dimensions {
                args.push(format!("--params={w},{h}"));
            }

            match run_tool(&tool, &args, "theme artifact generation").await {
                Ok(()) => debug!(variant = variant.label(), "theme variant rendered"),
                Err(e) => {
                    warn!(variant = variant.label(), error = %e, "theme variant failed");
                    failures.push(format!("{}: {e}", variant.label()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(ConvertError::StartupFatal {
                stage: "theme artifact generation",
                detail: failures.join("; "),
            });
        }
        Ok(output_dir)
    }
}

/// Run one preparation tool to completion. Missing binary and non-zero
/// exit are both [`ConvertError::StartupFatal`] for the given stage.
async fn run_tool(binary: &Path, args: &[String], stage: &'static str) -> Result<(), ConvertError> {
    debug!(binary = %binary.display(), ?args, "running preparation tool");

    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ConvertError::StartupFatal {
            stage,
            detail: format!("failed to launch '{}': {e}", binary.display()),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConvertError::StartupFatal {
            stage,
            detail: format!(
                "'{}' exited with {:?}: {}",
                binary.display(),
                output.status.code(),
                stderr.trim()
            ),
        });
    }
    Ok(())
}
