use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use krusty_jobs::{
    DeviceFileJob, GcodeLines, LineProcessor, LocalFileJob, LocalGcodeFileJob,
    LocalGcodeStreamJob, LocalPlainFileJob, LoggingListener, PlainLines, PrintJob,
    PrintJobError, RawLines, SimulatedProtocol, TextEncoding, stream_lines,
};
use krusty_shared::ProtocolError;
use krusty_shared::config::{self, ConfigError, JobsConfig};

#[derive(Debug, Parser)]
#[command(name = "job-runner", version, about = "Run print jobs against a simulated printer")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream a local G-code file line by line
    Local {
        path: PathBuf,
        /// Byte offset to resume from
        #[arg(long, default_value_t = 0)]
        position: u64,
        /// Send lines untouched instead of stripping comments and applying offsets
        #[arg(long)]
        raw: bool,
    },
    /// Copy a local file onto the device's storage
    Stream {
        path: PathBuf,
        /// Name on the device, defaults to the local file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print a file stored on the device
    Device {
        name: String,
        #[arg(long, default_value_t = 0)]
        position: u64,
    },
    /// Show the first lines of a local file
    Preview {
        path: PathBuf,
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Job(#[from] PrintJobError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[tokio::main]
async fn main() -> Result<(), RunError> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path);
            config::load_config(path)?
        }
        None => JobsConfig::default(),
    };
    let encoding = TextEncoding::from_label(&config.job.encoding)?;
    let protocol = Arc::new(SimulatedProtocol::new(&config.simulator));

    match cli.command {
        Command::Local { path, position, raw } => {
            if raw {
                let job: LocalPlainFileJob = LocalFileJob::new(path, encoding, PlainLines).await?;
                run_local(&job, &protocol, position).await?;
            } else {
                let kind = GcodeLines::new(config.offsets);
                let job: LocalGcodeFileJob = LocalFileJob::new(path, encoding, kind).await?;
                run_local(&job, &protocol, position).await?;
            }
        }
        Command::Stream { path, name } => {
            let name = name.unwrap_or_else(|| device_name(&path));
            let job: LocalGcodeStreamJob = LocalFileJob::new(path, encoding, RawLines).await?;
            run_local(&job, &protocol, 0).await?;
            let size = protocol.finish_upload(name.as_str())?;
            tracing::info!("Device now holds {} ({} bytes)", name, size);
        }
        Command::Device { name, position } => {
            run_device(&name, &protocol, &config, position).await?;
        }
        Command::Preview { path, lines } => {
            let job: LocalPlainFileJob = LocalFileJob::new(path, encoding, PlainLines).await?;
            if let Some(stream) = job.content_stream() {
                let mut stream = stream.take(lines);
                while let Some(line) = stream.next().await {
                    println!("{}", line?.trim_end());
                }
            }
        }
    }
    Ok(())
}

async fn run_local<K: LineProcessor>(
    job: &LocalFileJob<K>,
    protocol: &Arc<SimulatedProtocol>,
    position: u64,
) -> Result<(), RunError> {
    job.register_listener(Arc::new(LoggingListener));
    job.process(protocol.clone(), position).await?;
    let sent = stream_lines(job, |line| protocol.send_line(line)).await?;
    tracing::info!(
        "Sent {} lines from {} in {:.2?}",
        sent,
        job.path().display(),
        job.core().elapsed().unwrap_or_default()
    );
    Ok(())
}

async fn run_device(
    name: &str,
    protocol: &Arc<SimulatedProtocol>,
    config: &JobsConfig,
    position: u64,
) -> Result<(), RunError> {
    let job = DeviceFileJob::new(name, config.job.status_interval());
    job.register_listener(Arc::new(LoggingListener));
    job.process(protocol.clone(), position).await?;

    let finished = job.wait_finished();
    tokio::pin!(finished);
    let mut report = tokio::time::interval(config.job.status_interval());
    let state = loop {
        tokio::select! {
            state = &mut finished => break state,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling device print");
                job.cancel().await;
                break job.state();
            }
            _ = report.tick() => {
                if let Some(progress) = job.progress() {
                    tracing::info!(
                        "{}: {:.1}% (estimated total {:.0}s)",
                        name,
                        progress * 100.0,
                        job.time_estimate(std::time::Duration::ZERO).unwrap_or(0.0)
                    );
                }
            }
        }
    };
    tracing::info!("Device print of {} finished: {:?}", name, state);
    Ok(())
}

fn device_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.gcode".to_string())
}
