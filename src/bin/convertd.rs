//! CLI binary for convertd.
//!
//! A thin shim over the library crate: resolves `ServiceConfig` from
//! environment and flags, runs the preparation stage or conversions, and
//! prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convertd::sniff::file_condition;
use convertd::{
    ArtifactPayload, ConversionRequest, ConversionService, DocumentFormat, FileCondition,
    FormatFamily, InputSource, OutputTarget, PreparationStage, ServiceConfig, X2tEngine,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One-time environment preparation (fonts, themes, engine cache)
  convertd prepare

  # Convert a document to PDF (output path inferred)
  convertd convert report.docx

  # Explicit output path and target format
  convertd convert sheet.xlsx --to csv -o sheet.csv

  # Convert from a URL
  convertd convert https://example.com/minutes.odt -o minutes.pdf

  # Password-protected input
  convertd convert secret.docx --password hunter2

  # Batch conversion with bounded concurrency
  convertd batch *.docx --to pdf --out-dir ./pdf --concurrency 4

  # Identify a file and list its legal targets (no engine needed)
  convertd inspect mystery.bin

ENVIRONMENT VARIABLES:
  CONVERTD_ENGINE_DIR        Conversion-engine install directory (alias: X2T_PATH)
  CONVERTD_TOOL_DIR          Font/theme generator directory
  CONVERTD_FONT_DIR          Custom-font source directory (alias: X2T_FONTS_PATH)
  CONVERTD_THEME_DIR         Presentation-theme source directory
  CONVERTD_DATA_DIR          Generated-artifact root
  CONVERTD_WORK_DIR          Per-request staging root
  CONVERTD_MAX_INPUT_SIZE    Input size limit in bytes (default 100 MiB)
  CONVERTD_ENGINE_TIMEOUT    Engine timeout in seconds (default 120)
  CONVERTD_DOWNLOAD_TIMEOUT  URL download timeout in seconds (default 120)

SETUP:
  1. Prepare once:    convertd prepare
  2. Convert:         convertd convert document.docx -o document.pdf
"#;

/// Convert office documents via an external conversion engine.
#[derive(Parser, Debug)]
#[command(
    name = "convertd",
    version,
    about = "Convert office documents via an external conversion engine",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CONVERTD_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CONVERTD_QUIET", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the one-time environment preparation (fonts, themes, cache).
    Prepare,

    /// Convert a single document.
    Convert {
        /// Local file path or HTTP/HTTPS URL.
        input: String,

        /// Output file path. Defaults to the input name with the target
        /// extension, in the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target format.
        #[arg(long, default_value = "pdf")]
        to: DocumentFormat,

        /// Declared source format; inferred from the extension or leading
        /// bytes when omitted.
        #[arg(long)]
        from: Option<DocumentFormat>,

        /// Password for protected documents.
        #[arg(long, env = "CONVERTD_PASSWORD")]
        password: Option<String>,
    },

    /// Identify a local file and print its legal conversion targets.
    Inspect {
        /// File to inspect.
        input: PathBuf,

        /// Declared format; inferred from the extension or leading bytes
        /// when omitted.
        #[arg(long)]
        from: Option<DocumentFormat>,

        /// Print machine-readable JSON instead of the table.
        #[arg(long)]
        json: bool,
    },

    /// Convert many documents with bounded concurrency.
    Batch {
        /// Input file paths.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Target format.
        #[arg(long, default_value = "pdf")]
        to: DocumentFormat,

        /// Directory for converted outputs.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Conversions in flight at once.
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let config = Arc::new(ServiceConfig::from_env().context("Invalid configuration")?);
    let engine = Arc::new(X2tEngine::new(&config));

    match cli.command {
        Command::Prepare => {
            let prepared = PreparationStage::new(config)
                .run(engine.as_ref())
                .await
                .context("Environment preparation failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} environment prepared  {}",
                    green("✔"),
                    dim(&format!(
                        "{} fonts, cache {}",
                        prepared.fonts.len(),
                        if prepared.cache_warmed { "warm" } else { "cold" }
                    )),
                );
            }
        }

        Command::Convert {
            input,
            output,
            to,
            from,
            password,
        } => {
            let service = ConversionService::new(config, engine);
            let source = if input.starts_with("http://") || input.starts_with("https://") {
                InputSource::Url(input.clone())
            } else {
                InputSource::Path(PathBuf::from(&input))
            };
            let output = output.unwrap_or_else(|| default_output(&input, to));

            let mut request = ConversionRequest {
                input: source,
                source: from,
                target: to,
                output: OutputTarget::File(output.clone()),
                password: None,
            };
            if let Some(pwd) = password {
                request = request.with_password(pwd);
            }

            let artifact = service.convert(request).await.context("Conversion failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} {}  {}",
                    green("✔"),
                    bold(&output.display().to_string()),
                    dim(&format!("{}ms in engine", artifact.engine_time.as_millis())),
                );
            }
        }

        Command::Inspect { input, from, json } => {
            let meta = tokio::fs::metadata(&input)
                .await
                .with_context(|| format!("Cannot read {}", input.display()))?;
            let mut prefix = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Cannot read {}", input.display()))?;
            prefix.truncate(64);

            let format = from
                .or_else(|| {
                    input
                        .extension()
                        .and_then(|e| e.to_str())
                        .and_then(DocumentFormat::from_extension)
                })
                .or_else(|| DocumentFormat::from_magic(&prefix));

            let details = format.map(|format| {
                let family = match format.family() {
                    FormatFamily::Word => "word processing",
                    FormatFamily::Spreadsheet => "spreadsheet",
                    FormatFamily::Presentation => "presentation",
                    FormatFamily::Fixed => "fixed layout",
                };
                let condition = match file_condition(&prefix, format) {
                    FileCondition::Unremarkable => "unremarkable",
                    FileCondition::LikelyEncrypted => "likely encrypted",
                    FileCondition::LikelyCorrupted => "likely corrupted",
                };
                let targets: Vec<&str> = DocumentFormat::ALL
                    .into_iter()
                    .filter(|t| format.can_convert_to(*t) && *t != format)
                    .map(|t| t.extension())
                    .collect();
                (format, family, condition, targets)
            });

            if json {
                let value = match &details {
                    Some((format, family, condition, targets)) => serde_json::json!({
                        "file": input.display().to_string(),
                        "size": meta.len(),
                        "format": format.extension(),
                        "content_type": format.content_type(),
                        "family": family,
                        "condition": condition,
                        "targets": targets,
                    }),
                    None => serde_json::json!({
                        "file": input.display().to_string(),
                        "size": meta.len(),
                        "format": serde_json::Value::Null,
                    }),
                };
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("File:       {}", input.display());
                println!("Size:       {} bytes", meta.len());
                match details {
                    Some((format, family, condition, targets)) => {
                        println!("Format:     {} ({})", format, format.content_type());
                        println!("Family:     {family}");
                        println!("Container:  {condition}");
                        println!("Targets:    {}", targets.join(", "));
                    }
                    None => {
                        println!("Format:     unrecognised (declare one with --from)");
                    }
                }
            }
        }

        Command::Batch {
            inputs,
            to,
            out_dir,
            concurrency,
        } => {
            let service = ConversionService::new(config, engine);
            let total = inputs.len();

            let bar = if cli.quiet {
                ProgressBar::hidden()
            } else {
                let bar = ProgressBar::new(total as u64);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner:.cyan} [{bar:42.green/238}] {pos:>3}/{len} files  ⏱ {elapsed_precise}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▉▊▋▌▍▎▏  "),
                );
                bar
            };

            let requests: Vec<ConversionRequest> = inputs
                .iter()
                .map(|path| {
                    let name = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "output".into());
                    ConversionRequest::file_to_file(
                        path,
                        out_dir.join(format!("{name}.{}", to.extension())),
                        to,
                    )
                })
                .collect();

            let results = service.convert_many(requests, concurrency).await;

            let mut failed = 0usize;
            for (path, result) in inputs.iter().zip(&results) {
                match result {
                    Ok(artifact) => {
                        if let ArtifactPayload::File(dest) = &artifact.payload {
                            bar.println(format!(
                                "  {} {}  →  {}",
                                green("✓"),
                                path.display(),
                                dim(&dest.display().to_string()),
                            ));
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        bar.println(format!("  {} {}  {}", red("✗"), path.display(), red(&e.to_string())));
                    }
                }
                bar.inc(1);
            }
            bar.finish_and_clear();

            if !cli.quiet {
                if failed == 0 {
                    eprintln!("{} {} files converted", green("✔"), bold(&total.to_string()));
                } else {
                    eprintln!(
                        "{} {}/{} files converted  ({} failed)",
                        red("✘"),
                        total - failed,
                        total,
                        red(&failed.to_string()),
                    );
                }
            }
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Default output path: input file name (or URL leaf) with the target
/// extension, in the current directory.
fn default_output(input: &str, target: DocumentFormat) -> PathBuf {
    let leaf = input
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(input);
    let stem = leaf.rsplit_once('.').map(|(s, _)| s).unwrap_or(leaf);
    let stem = if stem.is_empty() { "output" } else { stem };
    PathBuf::from(format!("{stem}.{}", target.extension()))
}
