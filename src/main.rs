use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use kagari::config::CONFIG_FILE;
use kagari::{Config, Outcome, Pipeline, Run};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the full build once
    #[command(alias = "default")]
    Build,
    /// Build, then rebuild affected tasks on every change
    Watch {
        /// Serve the output directory with live reload at the same time
        #[arg(long)]
        serve: bool,
    },
    /// Serve the output directory with live reload
    Serve,
    /// Print the task graph as a Mermaid diagram
    Graph,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file [default: kagari.toml, if present]
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Number of parallel tasks, 0 for one per CPU
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Write a Mermaid diagram of the build with timings to this file
    #[arg(long, global = true)]
    report: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(Utf8Path::new(CONFIG_FILE))?,
    };

    if let Some(jobs) = args.jobs {
        config.runner.jobs = jobs;
    }

    let pipeline = Pipeline::new(config)?;

    match args.command.unwrap_or(Command::Build) {
        Command::Build => {
            let run = pipeline.build()?;
            if let Some(path) = &args.report {
                write_report(&pipeline, &run, path)?;
            }

            if run.outcome() == Outcome::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Watch { serve } => watch(&pipeline, serve)?,
        Command::Serve => serve(&pipeline)?,
        Command::Graph => print!("{}", pipeline.registry()),
    }

    Ok(ExitCode::SUCCESS)
}

fn write_report(pipeline: &Pipeline, run: &Run, path: &Utf8Path) -> anyhow::Result<()> {
    std::fs::write(path, run.render_mermaid(pipeline.registry()))?;
    tracing::info!("wrote build report to {}", path);
    Ok(())
}

#[cfg(feature = "live")]
fn watch(pipeline: &Pipeline, serve: bool) -> anyhow::Result<()> {
    Ok(pipeline.watch(serve)?)
}

#[cfg(not(feature = "live"))]
fn watch(_: &Pipeline, _: bool) -> anyhow::Result<()> {
    anyhow::bail!("kagari was built without the `live` feature")
}

#[cfg(feature = "server")]
fn serve(pipeline: &Pipeline) -> anyhow::Result<()> {
    Ok(pipeline.serve()?)
}

#[cfg(not(feature = "server"))]
fn serve(_: &Pipeline) -> anyhow::Result<()> {
    anyhow::bail!("kagari was built without the `server` feature")
}
