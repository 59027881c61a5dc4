use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vidstage::{
    key::parse_namespace, JobKey, MediaTempService, ProcessOptions, Quality, SourceFile, VidstageConfig,
};

/// Crash-recoverable H.264 normalisation of video files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe hardware encoders and print the encoder that would be used
    Detect,
    /// Ingest and transcode one file
    Process {
        file: PathBuf,
        /// Caller-side identifier of the file
        #[arg(long)]
        id: String,
        /// Namespace as a/b/c
        #[arg(long)]
        namespace: String,
        /// Re-encode even if the source is already H.264
        #[arg(long)]
        force: bool,
        /// low, medium or high (default from config)
        #[arg(long)]
        quality: Option<Quality>,
    },
    /// List jobs whose owner is gone
    Dangling {
        #[arg(long)]
        namespace: String,
    },
    /// Startup recovery: report finished jobs, optionally drop interrupted ones
    Recover {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        discard_incomplete: bool,
    },
    /// Copy a finished output somewhere else
    Fetch {
        #[arg(long)]
        id: String,
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        dest: PathBuf,
    },
    /// Delete a job directory
    Cleanup {
        #[arg(long)]
        id: String,
        #[arg(long)]
        namespace: String,
    },
    /// Delete dangling jobs older than the given age, in every namespace
    Sweep {
        #[arg(long, default_value_t = 86_400)]
        max_age_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = VidstageConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!("Temp tree: {}", cfg.base_dir.display());
    info!("Segment duration: {}s", cfg.segment_duration_secs);

    let service = MediaTempService::native(cfg);
    if matches!(args.command, Command::Process { .. }) {
        let capability = service.detect().await;
        info!("Encoder: {}", capability.config().codec_name);
    }

    match args.command {
        Command::Detect => {
            let capability = service.detect().await;
            print_json(capability)?;
        }
        Command::Process {
            file,
            id,
            namespace,
            force,
            quality,
        } => {
            let namespace = parse_namespace(&namespace)?;
            run_process(&service, file, &id, &namespace, force, quality).await?;
        }
        Command::Dangling { namespace } => {
            let namespace = parse_namespace(&namespace)?;
            let dangling = service.list_dangling(&namespace).await?;
            info!("{} dangling job(s) in {}", dangling.len(), namespace.join("/"));
            print_json(&dangling)?;
        }
        Command::Recover {
            namespace,
            discard_incomplete,
        } => {
            let namespace = parse_namespace(&namespace)?;
            info!("🔄 Starting recovery checks for {}...", namespace.join("/"));
            let report = service.recover(&namespace, discard_incomplete).await?;
            for job in &report.complete {
                info!("Completed output awaiting pickup: {}", job.dir.display());
            }
            for job in &report.interrupted {
                warn!("Interrupted job left in place: {}", job.dir.display());
            }
            info!(
                "✅ Recovery complete: {} complete, {} interrupted, {} discarded",
                report.complete.len(),
                report.interrupted.len(),
                report.discarded.len()
            );
            print_json(&report)?;
        }
        Command::Fetch { id, namespace, dest } => {
            let namespace = parse_namespace(&namespace)?;
            let mut output = service.fetch_output(&id, &namespace).await?;
            let mut target = tokio::fs::File::create(&dest)
                .await
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            let copied = tokio::io::copy(&mut output.file, &mut target)
                .await
                .with_context(|| format!("Failed to copy output to {}", dest.display()))?;
            target.sync_all().await?;
            info!(
                "Fetched {} ({}, {}) to {}",
                output.path.display(),
                format_size(copied, DECIMAL),
                output.mime_type,
                dest.display()
            );
        }
        Command::Cleanup { id, namespace } => {
            let namespace = parse_namespace(&namespace)?;
            service.cleanup(&id, &namespace).await?;
            info!("Cleaned up {}/{}", namespace.join("/"), id);
        }
        Command::Sweep { max_age_secs } => {
            let removed = service.sweep(max_age_secs).await?;
            println!("{removed}");
        }
    }

    Ok(())
}

async fn run_process(
    service: &MediaTempService,
    file: PathBuf,
    id: &str,
    namespace: &[String],
    force: bool,
    quality: Option<Quality>,
) -> Result<()> {
    let key = JobKey::new(namespace, id)?;
    let source = SourceFile::from_path(file);
    let size = tokio::fs::metadata(&source.path)
        .await
        .with_context(|| format!("Failed to read {}", source.path.display()))?
        .len();
    info!("Processing {} ({}) as {}", source.path.display(), format_size(size, DECIMAL), key);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, cancelling job");
                cancel.cancel();
            }
        })
    };

    // Log every 5% step
    let last_logged = Arc::new(AtomicI64::new(-1));
    let options = ProcessOptions {
        on_progress: Some(Arc::new(move |percent: f64| {
            let step = (percent / 5.0).floor() as i64;
            if last_logged.fetch_max(step, Ordering::Relaxed) < step {
                info!("Progress: {:.1}%", percent);
            }
        })),
        cancel: Some(cancel),
        force_convert: force,
        quality,
    };

    let result = service.process(id, namespace, &source, options).await;
    ctrl_c.abort();

    let result = result.with_context(|| format!("Processing {key} failed"))?;
    info!(
        "✅ Output ready: {} ({}, converted: {})",
        result.output_path.display(),
        format_size(result.size, DECIMAL),
        result.was_converted
    );
    print_json(&result)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
