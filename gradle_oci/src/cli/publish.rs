use crate::cli::{build::GradleArgs, success, Cli};
use crate::engine::Engine;
use crate::pipeline::{self, PublishRequest};
use crate::secret::Secret;
use anyhow::{Context, Result};
use clap::Args;

#[derive(Debug, Args, Clone)]
pub struct PublishArgs {
    #[command(flatten)]
    pub gradle: GradleArgs,

    /// OCI registry the image is published to. Defaults to the configured registry.
    #[arg(long)]
    pub oci_registry: Option<String>,

    /// Username to authenticate with the OCI registry.
    #[arg(long)]
    pub oci_username: String,

    /// Password or token to authenticate with the OCI registry.
    /// Accepts 'env:NAME', 'file:PATH' or '@' to read from stdin.
    #[arg(long, value_name = "SECRET")]
    pub oci_password: Secret,

    /// Repository in the OCI registry the image is published to (usually the username for docker.io).
    #[arg(long)]
    pub oci_registry_repository: String,

    /// Image name (eg: --image-name=myapp).
    #[arg(long)]
    pub image_name: String,

    /// Image tag (eg: --image-tag=v1a1).
    #[arg(long)]
    pub image_tag: String,
}

impl Cli {
    pub async fn publish(&self, engine: &dyn Engine, args: &PublishArgs) -> Result<()> {
        let build = args.gradle.to_request(&self.conf.defaults)?;

        let registry = args
            .oci_registry
            .as_deref()
            .unwrap_or(&self.conf.defaults.registry);

        let request = PublishRequest::new(
            build,
            &args.oci_username,
            args.oci_password.clone(),
            &args.oci_registry_repository,
            &args.image_name,
            &args.image_tag,
        )
        .registry(registry);

        let published = pipeline::publish(engine, &request)
            .await
            .with_context(|| format!("Could not publish '{}'", request.address()))?;

        success(&format!("Published {}", request.address()));

        // The reference is the only thing written to stdout so it can be captured by scripts.
        println!("{published}");

        Ok(())
    }
}
