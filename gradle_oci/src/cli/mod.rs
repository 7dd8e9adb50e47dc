mod build;
mod publish;

use crate::conf::{self, Config, LogFormat};
use crate::engine::{self, Engine};
use crate::pipeline::PipelineError;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// How many trailing lines of a failed task's output are shown.
const FAILURE_OUTPUT_LINES: usize = 15;

#[derive(Debug, Parser)]
#[clap(name = "gradle-oci")]
#[clap(about = "Build Gradle projects in a container and publish them as JRE images.")]
#[clap(
    long_about = "Build Gradle projects in a container and publish them as JRE images.\n\n\
    Gradle tasks run one at a time, in the order given, through the project's gradle wrapper inside an \
    eclipse-temurin JDK container. The resulting project directory can be exported or layered onto the matching \
    eclipse-temurin JRE image and pushed to any OCI registry."
)]
#[clap(version)]
struct Args {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Turn on debug logging, including the output of every gradle task.
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Log output format (pretty or json); overrides the configured format.
    #[clap(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run gradle tasks against a source directory inside a JDK container.
    Build(build::BuildArgs),

    /// Build a source directory, then publish the result as a JRE image to an OCI registry.
    Publish(publish::PublishArgs),
}

pub struct Cli {
    conf: Config,
    command: Commands,
}

impl Cli {
    /// Parses arguments and configuration and sets up logging. Flags always get final priority over all other
    /// configuration types.
    pub fn new() -> Result<Self> {
        let args = Args::parse();

        let mut conf =
            Config::load(args.config.as_deref()).context("Could not load configuration")?;

        if let Some(log_format) = args.log_format {
            conf.general.log_format = log_format;
        }

        init_logging(&conf.general, args.verbose)?;

        Ok(Self {
            conf,
            command: args.command,
        })
    }

    /// Connects to the container engine and runs the requested command. Containers are cleaned up no matter how
    /// the command ends, including on Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let engine = engine::init_engine(&self.conf.engine)
            .await
            .with_context(|| {
                format!(
                    "Could not initialize {} container engine",
                    self.conf.engine.kind
                )
            })?;

        self.run_with(engine).await
    }

    async fn run_with(&self, engine: Arc<dyn Engine>) -> Result<()> {
        let result = tokio::select! {
            result = self.dispatch(engine.as_ref()) => result,
            _ = tokio::signal::ctrl_c() => Err(anyhow!("Cancelled")),
        };

        if let Err(e) = engine.cleanup().await {
            warn!(error = %e, "Could not clean up containers");
        }

        if let Err(e) = &result {
            print_task_failure(e);
        }

        result
    }

    async fn dispatch(&self, engine: &dyn Engine) -> Result<()> {
        match &self.command {
            Commands::Build(args) => self.build(engine, args).await,
            Commands::Publish(args) => self.publish(engine, args).await,
        }
    }
}

fn init_logging(general: &conf::General, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        general.log_level.as_str()
    };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Could not parse log_level '{level}'"))?,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let initialized = match general.log_format {
        LogFormat::Pretty => subscriber.compact().without_time().try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };

    initialized.map_err(|e| anyhow!("Could not init logging; {e}"))
}

pub fn success(message: &str) {
    eprintln!("{} {}", "✓".green(), message);
}

/// Prints the tail of a failed gradle task's output. The full output is available with --verbose.
fn print_task_failure(err: &anyhow::Error) {
    let Some(PipelineError::Task { task, output, .. }) = err.downcast_ref::<PipelineError>() else {
        return;
    };

    eprintln!(
        "{} Gradle task '{}' failed; Examine partial output below:\n...",
        "x".red(),
        task.cyan()
    );

    for line in tail(output, FAILURE_OUTPUT_LINES) {
        eprintln!("  {}", line);
    }

    eprintln!("...\nView full output by re-running with {}", "--verbose".cyan());
}

fn tail(output: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().collect();
    lines[lines.len().saturating_sub(count)..].to_vec()
}
