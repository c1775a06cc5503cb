use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use faceswap_core::analysis::{DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};
use faceswap_core::{FaceAnalysis, FaceAnalyzer, FaceSwapper, ModelPaths, SwapError, SwapPipeline};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;
mod session;
mod worker;

use config::Config;
use session::Session;

#[derive(Parser)]
#[command(name = "faceswap", about = "Swap a face from one image onto another")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the face in the target image with the face from the source image
    Swap {
        /// Image providing the identity
        #[arg(short, long)]
        source: Option<PathBuf>,
        /// Image whose face is replaced
        #[arg(short, long)]
        target: Option<PathBuf>,
        /// Source strength in percent (0-100); out-of-range values are clamped
        #[arg(long, allow_negative_numbers = true)]
        strength: Option<i64>,
        /// Where to save the result (.jpg or .png); prompts when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Swap model; its embedding map is read from the same path with an .emap extension
        #[arg(long)]
        swap_model: Option<PathBuf>,
    },
    /// List the faces detected in an image
    Detect {
        image: PathBuf,
        /// Print detections as JSON
        #[arg(long)]
        json: bool,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Show configuration and which model files are present
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Swap {
            source,
            target,
            strength,
            output,
            model_dir,
            swap_model,
        } => {
            let config = config.with_overrides(model_dir, swap_model);
            let mut session = Session::new(config.model_paths(), config.default_strength);
            if let Some(path) = source {
                session.select_source(path);
            }
            if let Some(path) = target {
                session.select_target(path);
            }
            if let Some(percent) = strength {
                session.set_strength(percent);
            }
            let intra_threads = config.intra_threads;
            let result = run_swap(&mut session, output, move |models: &ModelPaths| {
                SwapPipeline::load(models, intra_threads)
            })
            .await;
            if let Err(err) = result {
                eprintln!("{err:#}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Detect {
            image,
            json,
            model_dir,
        } => {
            let config = config.with_overrides(model_dir, None);
            run_detect(&config, &image, json)
        }
        Commands::Status => {
            print_status(&config);
            Ok(())
        }
    }
}

/// One swap run: validate, run on the worker, blend, confirm a path, save.
///
/// `build` runs on the worker thread and produces the pipeline for the run.
async fn run_swap<A, S, F>(session: &mut Session, output: Option<PathBuf>, build: F) -> Result<()>
where
    A: FaceAnalyzer,
    S: FaceSwapper,
    F: FnOnce(&ModelPaths) -> Result<SwapPipeline<A, S>, SwapError> + Send + 'static,
{
    let request = session.begin().map_err(|err| anyhow!("warning: {err}"))?;

    tracing::info!(
        source = %request.source.display(),
        target = %request.target.display(),
        strength = %session.strength(),
        "starting face swap"
    );

    let models = request.models.clone();
    let run = worker::spawn_swap(&request, move || build(&models))
        .context("failed to start swap worker")?;

    let result = run
        .wait(|p| {
            eprint!("\rswapping faces: {:>3}%", p.percent());
            let _ = std::io::stderr().flush();
        })
        .await;
    eprintln!();
    session.finish();
    tracing::debug!(state = ?session.state(), "run finished");

    let outcome = result.context("face swap failed")?;
    let blended = faceswap_core::blend(&outcome.composite, &outcome.target, request.strength)?;

    let Some(path) = confirm_output(output).await? else {
        println!("result discarded");
        return Ok(());
    };
    save_image(&blended, &path)?;
    println!("image saved to {}", path.display());
    Ok(())
}

/// The destination path, from `--output` or an interactive prompt.
/// `None` when the user declines.
async fn confirm_output(output: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if output.is_some() {
        return Ok(output);
    }
    print!("save swapped image to (.jpg/.png, empty to discard): ");
    std::io::stdout().flush()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines.next_line().await?.unwrap_or_default();
    let line = line.trim();
    Ok((!line.is_empty()).then(|| PathBuf::from(line)))
}

fn save_image(image: &image::RgbImage, path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if !matches!(ext.as_deref(), Some("jpg" | "jpeg" | "png")) {
        bail!("unsupported output format for {}: use .jpg or .png", path.display());
    }
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "result written");
    Ok(())
}

/// Diagnostics: run the analyzer alone on one image.
fn run_detect(config: &Config, path: &Path, json: bool) -> Result<()> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_rgb8();
    let mut analysis = FaceAnalysis::load(&config.model_dir, config.intra_threads)?;
    let faces = analysis.detect(&image)?;

    if json {
        let boxes: Vec<_> = faces.iter().map(|f| &f.bbox).collect();
        println!("{}", serde_json::to_string_pretty(&boxes)?);
        return Ok(());
    }

    println!("{} face(s) in {}", faces.len(), path.display());
    for (i, face) in faces.iter().enumerate() {
        let b = &face.bbox;
        println!(
            "  #{i}: confidence {:.3} at ({:.0}, {:.0}) size {:.0}x{:.0}{}",
            b.confidence,
            b.x,
            b.y,
            b.width,
            b.height,
            if i == 0 { "  <- used for swaps" } else { "" }
        );
    }
    Ok(())
}

fn print_status(config: &Config) {
    let paths = config.model_paths();
    let status = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "model_dir": paths.model_dir.display().to_string(),
        "intra_threads": config.intra_threads,
        "default_strength": config.default_strength.percent(),
        "models": {
            "detector": paths.model_dir.join(DETECTOR_MODEL_FILE).exists(),
            "recognizer": paths.model_dir.join(RECOGNIZER_MODEL_FILE).exists(),
            "swapper": paths.swap_model.exists(),
            "swapper_emap": paths.swap_emap.exists(),
        },
    });
    println!("{status:#}");
}
