use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use texup::config::{self, ConfigError};
use texup::source::{self, SourceError, SourceKind, SourceSpec};
use texup::tools::{Converter, NcnnBackend, Toolchain};
use texup::{batch, server, session};

/// Flags shared by both commands.
#[derive(clap::Args, Clone)]
struct RunArgs {
    /// Mod folder name (for example: afterlife_arena)
    #[arg(long = "mod", value_name = "NAME")]
    mod_name: String,

    /// Explicit source PK3 path
    #[arg(long)]
    source_pk3: Option<PathBuf>,

    /// Explicit source directory path
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Explicit output PK3 path
    #[arg(long)]
    output_pk3: Option<PathBuf>,

    /// Real-ESRGAN binary path (default: <root-dir>/.tools/realesrgan-ncnn-vulkan)
    #[arg(long)]
    tool_bin: Option<PathBuf>,

    /// Real-ESRGAN models directory (default: <root-dir>/.tools/realesrgan-models)
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Skip upscaling when width or height is greater than this value
    #[arg(long, default_value_t = 1024)]
    max_dimension: u32,

    /// Real-ESRGAN scale factor
    #[arg(long, default_value_t = 4)]
    scale: u32,

    /// Real-ESRGAN model name
    #[arg(long, default_value = "realesrgan-x4plus")]
    model: String,

    /// Workspace path (default: <root-dir>/.tmp/upscale_work)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep the workspace after completion
    #[arg(long)]
    keep_work_dir: bool,
}

#[derive(Parser)]
#[command(name = "texup")]
#[command(about = "Upscale models/players textures and package them as a load-last PK3 override")]
#[command(long_about = "\
Upscale models/players textures and package them as a load-last PK3 override

Point it at a game root containing mods/ and dist/. The source is resolved in
a fixed order: --source-pk3, dist/<mod>/z_<mod>.pk3, any other z_*.pk3 there,
--source-dir, then mods/<mod>. Every .tga/.png/.jpg under models/players/ is
upscaled with realesrgan-ncnn-vulkan and repackaged; TGA outputs are rewritten
with a bottom-left origin so the engine accepts them.

Two modes:

  batch    one pass, no questions asked; failures fall back to the original
  review   generates candidates, then serves a local web UI for side-by-side
           accept/reject/rerun decisions before packaging; the session is
           persisted after every change and can be resumed after a crash by
           re-running the same command")]
#[command(version)]
struct Cli {
    /// Game root directory containing mods/ and dist/
    #[arg(long, default_value = ".", global = true)]
    root_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upscale and package in one non-interactive pass
    Batch(RunArgs),
    /// Generate candidates and serve the interactive review UI
    Review {
        #[command(flatten)]
        run: RunArgs,

        /// Review server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Review server port
        #[arg(long, default_value_t = 8765)]
        port: u16,

        /// Review manifest path (default: <work-dir>/review/manifest.json)
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Repeatable rerun preset spec: name:model:scale
        #[arg(long = "preset", value_name = "NAME:MODEL:SCALE")]
        presets: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("texup=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Batch(args) => run_batch(&cli.root_dir, args),
        Command::Review {
            run,
            host,
            port,
            manifest,
            presets,
        } => run_review(&cli.root_dir, run, host, *port, manifest.as_deref(), presets),
    }
}

/// Everything both commands need before touching an image.
struct Prepared {
    spec: SourceSpec,
    output_pk3: PathBuf,
    work_dir: PathBuf,
    models_dir: PathBuf,
    backend: NcnnBackend,
}

fn prepare(root_dir: &Path, args: &RunArgs) -> Result<Prepared, Box<dyn std::error::Error>> {
    if args.max_dimension == 0 {
        return Err(ConfigError::BadMaxDimension.into());
    }
    if args.scale == 0 {
        return Err(ConfigError::BadScale.into());
    }

    let tool_bin = args
        .tool_bin
        .clone()
        .unwrap_or_else(|| root_dir.join(".tools").join("realesrgan-ncnn-vulkan"));
    let models_dir = args
        .models_dir
        .clone()
        .unwrap_or_else(|| root_dir.join(".tools").join("realesrgan-models"));
    let work_dir = args
        .work_dir
        .clone()
        .unwrap_or_else(|| root_dir.join(".tmp").join("upscale_work"));

    let spec = source::resolve_source(
        root_dir,
        &args.mod_name,
        args.source_pk3.as_deref(),
        args.source_dir.as_deref(),
    )?;
    let output_pk3 = source::resolve_output(root_dir, &args.mod_name, args.output_pk3.as_deref());

    let toolchain = Toolchain::locate(&tool_bin, &models_dir, &args.model)?;
    let converter = Converter::detect()?;
    let backend = NcnnBackend::new(toolchain, converter);

    let kind = match spec.kind {
        SourceKind::Pk3 => "pk3",
        SourceKind::Dir => "dir",
    };
    println!("Mod: {}", args.mod_name);
    println!("Source ({kind}): {}", spec.path.display());
    println!("Output PK3: {}", output_pk3.display());
    println!("Work dir: {}", work_dir.display());

    Ok(Prepared {
        spec,
        output_pk3,
        work_dir,
        models_dir,
        backend,
    })
}

fn run_batch(root_dir: &Path, args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let prepared = prepare(root_dir, args)?;

    // Batch has no resume semantics: always start from a clean workspace.
    if prepared.work_dir.exists() {
        std::fs::remove_dir_all(&prepared.work_dir)?;
    }
    std::fs::create_dir_all(&prepared.work_dir)?;

    let images = source::discover_images(&prepared.spec)?;
    let preset = config::Preset {
        name: "default".to_string(),
        model: args.model.clone(),
        scale: args.scale,
    };
    let outcome = batch::run(
        &prepared.backend,
        &images,
        &prepared.work_dir,
        &prepared.output_pk3,
        &preset,
        args.max_dimension,
    )?;

    println!();
    for line in outcome.stats.format_summary(args.max_dimension) {
        println!("{line}");
    }
    println!("Packaged files: {}", outcome.packaged_files);
    println!("Wrote: {}", prepared.output_pk3.display());

    cleanup_work_dir(&prepared.work_dir, args.keep_work_dir, true)?;
    Ok(())
}

fn run_review(
    root_dir: &Path,
    args: &RunArgs,
    host: &str,
    port: u16,
    manifest: Option<&Path>,
    preset_specs: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let prepared = prepare(root_dir, args)?;
    let review_root = prepared.work_dir.join("review");
    let manifest_path = match manifest {
        Some(path) => path.to_path_buf(),
        None => review_root.join("manifest.json"),
    };

    let presets = config::build_presets(
        preset_specs,
        &args.model,
        args.scale,
        &prepared.models_dir,
    )?;

    let images = source::discover_images(&prepared.spec)?;
    if images.is_empty() {
        return Err(SourceError::NoImages.into());
    }

    // A manifest left by an earlier (crashed or interrupted) run seeds the
    // decisions for every image that still exists.
    let prior = session::load_prior_decisions(&manifest_path);
    let (records, stats) = session::prepare_records(
        &prepared.backend,
        &images,
        &review_root,
        &prior,
        &presets,
        args.max_dimension,
    )?;

    let review_session = Arc::new(session::ReviewSession::new(
        Box::new(prepared.backend),
        review_root,
        manifest_path.clone(),
        prepared.output_pk3,
        presets,
        records,
    ));
    review_session.persist()?;

    println!();
    println!("Initial candidate generation complete.");
    for line in stats.format_summary(args.max_dimension) {
        println!("{line}");
    }
    println!("Review manifest: {}", manifest_path.display());
    println!("Review UI: http://{host}:{port}/");

    let addr: std::net::SocketAddr = format!("{host}:{port}").parse()?;
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::run(Arc::clone(&review_session), addr, shutdown))?;

    let finalized = review_session.is_finalized();
    if let Some(summary) = review_session.finalize_summary() {
        println!();
        println!("Review packaging complete.");
        println!("Output PK3: {}", summary.output_pk3);
        println!(
            "Accepted: {}, Rejected (original used): {}",
            summary.summary.accepted, summary.summary.rejected
        );
    } else {
        println!();
        println!("Review session not finalized; workspace kept for resume.");
    }

    cleanup_work_dir(&prepared.work_dir, args.keep_work_dir, finalized)?;
    Ok(())
}

/// The workspace survives unless the run completed and the operator did not
/// ask to keep it.
fn cleanup_work_dir(work_dir: &Path, keep: bool, completed: bool) -> std::io::Result<()> {
    if keep {
        println!("Kept work dir: {}", work_dir.display());
        return Ok(());
    }
    if completed && work_dir.exists() {
        std::fs::remove_dir_all(work_dir)?;
    }
    Ok(())
}
