//! End-to-end tests over the preparation stage and the request handler,
//! using scripted preparation tools and mock engines in place of the real
//! binaries.

use async_trait::async_trait;
use convertd::engine::{ConversionEngine, EngineJob, EngineOutcome};
use convertd::{
    ArtifactPayload, ConversionRequest, ConversionService, ConvertError, DocumentFormat,
    ServiceConfig,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Engine doubles ───────────────────────────────────────────────────────

/// Echoes the staged input back as the output, uppercased, after a small
/// delay. Lets concurrency tests verify that no request ever sees another
/// request's bytes.
struct EchoEngine {
    calls: AtomicUsize,
    cache_builds: AtomicUsize,
}

impl EchoEngine {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            cache_builds: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConversionEngine for EchoEngine {
    async fn convert(&self, job: &EngineJob) -> Result<EngineOutcome, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let input = tokio::fs::read(&job.input_path)
            .await
            .expect("staged input must exist");
        let output: Vec<u8> = input.to_ascii_uppercase();
        tokio::fs::write(&job.output_path, output)
            .await
            .expect("staging dir must be writable");
        Ok(EngineOutcome::Success)
    }

    async fn build_cache(&self) -> Result<EngineOutcome, ConvertError> {
        self.cache_builds.fetch_add(1, Ordering::SeqCst);
        Ok(EngineOutcome::Success)
    }
}

/// Never finishes. For timeout and cancellation paths.
struct HangingEngine;

#[async_trait]
impl ConversionEngine for HangingEngine {
    async fn convert(&self, _job: &EngineJob) -> Result<EngineOutcome, ConvertError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(EngineOutcome::Success)
    }

    async fn build_cache(&self) -> Result<EngineOutcome, ConvertError> {
        Ok(EngineOutcome::Success)
    }
}

fn test_config(work_dir: &Path) -> Arc<ServiceConfig> {
    Arc::new(
        ServiceConfig::builder()
            .work_dir(work_dir)
            .max_input_size_bytes(10 * 1024)
            .engine_timeout_secs(1)
            .build()
            .unwrap(),
    )
}

fn count_staging_dirs(work_dir: &Path) -> usize {
    std::fs::read_dir(work_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with("req-"))
                .count()
        })
        .unwrap_or(0)
}

// ── Request handler ──────────────────────────────────────────────────────

#[tokio::test]
async fn txt_to_pdf_happy_path_reports_pdf_content_type() {
    let work = TempDir::new().unwrap();
    let service = ConversionService::new(test_config(work.path()), Arc::new(EchoEngine::new()));

    let body = "lorem ipsum ".repeat(850); // ~10 KB
    let artifact = service
        .convert(ConversionRequest::bytes_to_memory(
            body.clone().into_bytes(),
            DocumentFormat::Txt,
            DocumentFormat::Pdf,
        ))
        .await
        .unwrap();

    assert_eq!(artifact.content_type, "application/pdf");
    assert_eq!(artifact.format, DocumentFormat::Pdf);
    match artifact.payload {
        ArtifactPayload::Memory(bytes) => {
            assert_eq!(bytes, body.to_ascii_uppercase().into_bytes());
        }
        other => panic!("expected memory payload, got {other:?}"),
    }
}

#[tokio::test]
async fn fifty_concurrent_requests_never_cross_streams() {
    let work = TempDir::new().unwrap();
    let engine = Arc::new(EchoEngine::new());
    let service = ConversionService::new(test_config(work.path()), engine.clone());

    let requests: Vec<ConversionRequest> = (0..50)
        .map(|i| {
            ConversionRequest::bytes_to_memory(
                format!("document number {i}").into_bytes(),
                DocumentFormat::Txt,
                DocumentFormat::Pdf,
            )
        })
        .collect();

    let results = service.convert_many(requests, 16).await;

    assert_eq!(results.len(), 50);
    for (i, result) in results.into_iter().enumerate() {
        let artifact = result.unwrap_or_else(|e| panic!("request {i} failed: {e}"));
        match artifact.payload {
            ArtifactPayload::Memory(bytes) => {
                assert_eq!(bytes, format!("DOCUMENT NUMBER {i}").into_bytes());
            }
            other => panic!("expected memory payload, got {other:?}"),
        }
    }
    assert_eq!(engine.calls.load(Ordering::SeqCst), 50);
    assert_eq!(count_staging_dirs(work.path()), 0);
}

#[tokio::test]
async fn timeout_terminates_and_cleans_staging() {
    let work = TempDir::new().unwrap();
    let service = ConversionService::new(test_config(work.path()), Arc::new(HangingEngine));

    let err = service
        .convert(ConversionRequest::bytes_to_memory(
            b"slow".to_vec(),
            DocumentFormat::Txt,
            DocumentFormat::Pdf,
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "TIMEOUT");
    assert!(matches!(err, ConvertError::Timeout { secs: 1 }));
    assert_eq!(count_staging_dirs(work.path()), 0, "staging dir leaked");
}

#[tokio::test]
async fn engine_diagnostic_passes_through_verbatim() {
    struct GrumpyEngine;

    #[async_trait]
    impl ConversionEngine for GrumpyEngine {
        async fn convert(&self, _job: &EngineJob) -> Result<EngineOutcome, ConvertError> {
            Ok(EngineOutcome::Failure {
                code: Some(-1),
                stderr: "x2t: sdkjs filter refused the document at chunk 7".into(),
            })
        }
        async fn build_cache(&self) -> Result<EngineOutcome, ConvertError> {
            Ok(EngineOutcome::Success)
        }
    }

    let work = TempDir::new().unwrap();
    let service = ConversionService::new(test_config(work.path()), Arc::new(GrumpyEngine));

    let err = service
        .convert(ConversionRequest::bytes_to_memory(
            b"hello".to_vec(),
            DocumentFormat::Txt,
            DocumentFormat::Pdf,
        ))
        .await
        .unwrap_err();

    match err {
        ConvertError::Engine {
            code, diagnostic, ..
        } => {
            assert_eq!(code, Some(-1));
            // Unknown code, so the stderr excerpt stands alone, untouched.
            assert_eq!(diagnostic, "x2t: sdkjs filter refused the document at chunk 7");
        }
        other => panic!("expected engine error, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_file_input_rejected_by_stat() {
    let work = TempDir::new().unwrap();
    let engine = Arc::new(EchoEngine::new());
    let service = ConversionService::new(test_config(work.path()), engine.clone());

    let big = work.path().join("big.txt");
    tokio::fs::write(&big, vec![b'a'; 20 * 1024]).await.unwrap();

    let err = service
        .convert(ConversionRequest::file_to_file(
            &big,
            work.path().join("big.pdf"),
            DocumentFormat::Pdf,
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "RESOURCE_LIMIT");
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

// ── Preparation stage (scripted tools, unix only) ────────────────────────

#[cfg(unix)]
mod preparation {
    use super::*;
    use convertd::PreparationStage;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Font generator double: writes deterministic manifests to the paths
    /// it is told to.
    fn install_fontsgen(tool_dir: &Path) {
        write_script(
            tool_dir,
            "allfontsgen",
            r#"for a in "$@"; do
  case "$a" in
    --allfonts-web=*) printf 'window.__fonts=[];\n' > "${a#*=}" ;;
    --selection=*) printf 'FONTSELECTION-V1' > "${a#*=}" ;;
  esac
done
"#,
        );
    }

    /// Theme generator double: drops one marker file per variant.
    fn install_themesgen(tool_dir: &Path) {
        write_script(
            tool_dir,
            "allthemesgen",
            r#"out=""; postfix="default"
for a in "$@"; do
  case "$a" in
    --output=*) out="${a#*=}" ;;
    --postfix=*) postfix="${a#*=}" ;;
  esac
done
printf 'theme-bytes' > "$out/theme_$postfix.png"
"#,
        );
    }

    fn prep_config(root: &Path) -> Arc<ServiceConfig> {
        Arc::new(
            ServiceConfig::builder()
                .tool_dir(root.join("tools"))
                .font_source_dir(root.join("fonts"))
                .theme_source_dir(root.join("theme-src"))
                .data_dir(root.join("data"))
                .work_dir(root.join("work"))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn full_stage_runs_in_order_and_warms_cache() {
        let root = TempDir::new().unwrap();
        let tools = root.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::create_dir_all(root.path().join("fonts")).unwrap();
        install_fontsgen(&tools);
        install_themesgen(&tools);

        let config = prep_config(root.path());
        let engine = EchoEngine::new();
        let prepared = PreparationStage::new(config.clone())
            .run(&engine)
            .await
            .unwrap();

        assert!(prepared.cache_warmed);
        assert_eq!(engine.cache_builds.load(Ordering::SeqCst), 1);
        assert!(prepared.font_artifacts.web_manifest.exists());
        assert!(prepared.font_artifacts.engine_manifest.exists());
        for variant in ["default", "ios", "android"] {
            let marker = prepared.theme_dir.join(format!("theme_{variant}.png"));
            assert!(marker.exists(), "missing theme variant {variant}");
        }
    }

    #[tokio::test]
    async fn stage_is_idempotent_byte_for_byte() {
        let root = TempDir::new().unwrap();
        let tools = root.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::create_dir_all(root.path().join("fonts")).unwrap();
        install_fontsgen(&tools);
        install_themesgen(&tools);

        let stage = PreparationStage::new(prep_config(root.path()));
        let engine = EchoEngine::new();

        // Snapshot every artifact the first full run produced.
        let artifacts = |prepared: &convertd::PreparedEnvironment| {
            let mut files = vec![
                prepared.font_artifacts.web_manifest.clone(),
                prepared.font_artifacts.engine_manifest.clone(),
            ];
            for variant in ["default", "ios", "android"] {
                files.push(prepared.theme_dir.join(format!("theme_{variant}.png")));
            }
            files
                .into_iter()
                .map(|path| std::fs::read(&path).unwrap())
                .collect::<Vec<_>>()
        };

        let first = stage.run(&engine).await.unwrap();
        let first_bytes = artifacts(&first);

        // A restart re-runs the whole stage and overwrites every artifact
        // with identical content.
        let second = stage.run(&engine).await.unwrap();
        assert_eq!(artifacts(&second), first_bytes);
        assert_eq!(engine.cache_builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_theme_generator_is_startup_fatal() {
        let root = TempDir::new().unwrap();
        let tools = root.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::create_dir_all(root.path().join("fonts")).unwrap();
        install_fontsgen(&tools);
        write_script(&tools, "allthemesgen", "echo 'renderer crashed' >&2\nexit 3\n");

        let stage = PreparationStage::new(prep_config(root.path()));
        let engine = EchoEngine::new();

        let err = stage.run(&engine).await.unwrap_err();
        assert_eq!(err.kind(), "STARTUP_FATAL");
        assert!(err.to_string().contains("theme artifact generation"));
        // The cache warm never ran: themes are a hard gate.
        assert_eq!(engine.cache_builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_font_generator_is_startup_fatal() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("tools")).unwrap();

        let stage = PreparationStage::new(prep_config(root.path()));
        let err = stage.generate_font_artifacts().await.unwrap_err();
        assert_eq!(err.kind(), "STARTUP_FATAL");
        assert!(err.to_string().contains("font artifact generation"));
    }

    #[tokio::test]
    async fn cache_warm_failure_is_not_fatal() {
        struct ColdCacheEngine;

        #[async_trait]
        impl ConversionEngine for ColdCacheEngine {
            async fn convert(&self, _job: &EngineJob) -> Result<EngineOutcome, ConvertError> {
                Ok(EngineOutcome::Success)
            }
            async fn build_cache(&self) -> Result<EngineOutcome, ConvertError> {
                Ok(EngineOutcome::Failure {
                    code: Some(1),
                    stderr: "no fonts indexed".into(),
                })
            }
        }

        let root = TempDir::new().unwrap();
        let tools = root.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::create_dir_all(root.path().join("fonts")).unwrap();
        install_fontsgen(&tools);
        install_themesgen(&tools);

        let prepared = PreparationStage::new(prep_config(root.path()))
            .run(&ColdCacheEngine)
            .await
            .unwrap();
        assert!(!prepared.cache_warmed);
    }
}
