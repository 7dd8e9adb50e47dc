use crate::cli::{success, Cli};
use crate::conf::Defaults;
use crate::directory::Directory;
use crate::engine::Engine;
use crate::pipeline::{self, BuildRequest};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Flags shared by every command that runs a gradle build.
#[derive(Debug, Args, Clone)]
pub struct GradleArgs {
    /// Java version; selects the eclipse-temurin image tag. Defaults to the configured version.
    #[arg(long)]
    pub java_version: Option<String>,

    /// Gradle tasks to run in order (eg: --gradle-tasks='downloadRepos,installDist').
    /// Each one is executed as ./gradlew <task>.
    #[arg(long, value_delimiter = ',')]
    pub gradle_tasks: Vec<String>,

    /// Source code directory containing the gradle wrapper (eg: --src=.).
    #[arg(long, value_name = "PATH")]
    pub src: PathBuf,
}

impl GradleArgs {
    pub fn to_request(&self, defaults: &Defaults) -> Result<BuildRequest> {
        let src = Directory::host(&self.src).with_context(|| {
            format!(
                "Could not open source directory '{}'",
                self.src.to_string_lossy()
            )
        })?;

        let java_version = self
            .java_version
            .as_deref()
            .unwrap_or(&defaults.java_version);

        Ok(BuildRequest::new(src)
            .java_version(java_version)
            .gradle_tasks(self.gradle_tasks.clone()))
    }
}

#[derive(Debug, Args, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub gradle: GradleArgs,

    /// Copy the built project directory to this path on the host.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

impl Cli {
    pub async fn build(&self, engine: &dyn Engine, args: &BuildArgs) -> Result<()> {
        let request = args.gradle.to_request(&self.conf.defaults)?;

        let built = pipeline::build(engine, &request)
            .await
            .context("Could not complete gradle build")?;

        let entries = built
            .entries()
            .context("Could not read build output")?;

        if let Some(output) = &args.output {
            built.export(output).with_context(|| {
                format!(
                    "Could not export build output to '{}'",
                    output.to_string_lossy()
                )
            })?;

            success(&format!(
                "Exported {} entries to '{}'",
                entries.len(),
                output.to_string_lossy()
            ));
        } else {
            success(&format!(
                "Build complete; {} entries in {}",
                entries.len(),
                pipeline::WORKDIR
            ));
        }

        Ok(())
    }
}
