#[cfg(test)]
pub(crate) mod tests;

use crate::directory::Directory;
use crate::engine::{Engine, EngineError};
use crate::secret::Secret;
use crate::validate;
use tracing::{debug, info, instrument};

/// Where the source is placed inside both the build and the runtime container.
pub const WORKDIR: &str = "/app";
pub const GRADLE_WRAPPER: &str = "gradlew";
pub const DEFAULT_JAVA_VERSION: &str = "21";
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Name used in errors for the steps that run before any gradle task.
pub const SETUP_STEP: &str = "setup";

const BASE_IMAGE: &str = "eclipse-temurin";

/// Represents different pipeline failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid {argument}: '{value}'; {description}")]
    InvalidArgument {
        argument: String,
        value: String,
        description: String,
    },

    /// A gradle task exited with a non-zero code. The output is kept whole.
    #[error("gradle task '{task}' failed with exit code {exit_code}")]
    Task {
        task: String,
        exit_code: i64,
        output: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Maps a failed exec onto the task that triggered it; every other engine error passes through untouched.
fn task_error(task: &str, err: EngineError) -> PipelineError {
    match err {
        EngineError::ExecFailed {
            exit_code, output, ..
        } => PipelineError::Task {
            task: task.to_string(),
            exit_code,
            output,
        },
        other => PipelineError::Engine(other),
    }
}

/// The JDK image gradle runs in.
pub fn jdk_image(java_version: &str) -> String {
    format!("{BASE_IMAGE}:{java_version}")
}

/// The runtime image the build output is layered onto.
pub fn jre_image(java_version: &str) -> String {
    format!("{BASE_IMAGE}:{java_version}-jre")
}

pub fn image_address(registry: &str, repository: &str, image_name: &str, image_tag: &str) -> String {
    format!("{registry}/{repository}/{image_name}:{image_tag}")
}

/// Everything needed to run gradle against a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub java_version: String,

    /// Executed one at a time, in order, each as `./gradlew <task>`.
    pub gradle_tasks: Vec<String>,

    /// Must contain the gradle wrapper at its root.
    pub src: Directory,
}

impl BuildRequest {
    pub fn new(src: Directory) -> Self {
        Self {
            java_version: DEFAULT_JAVA_VERSION.to_string(),
            gradle_tasks: vec![],
            src,
        }
    }

    pub fn java_version(mut self, java_version: &str) -> Self {
        self.java_version = java_version.to_string();
        self
    }

    pub fn gradle_tasks(mut self, gradle_tasks: Vec<String>) -> Self {
        self.gradle_tasks = gradle_tasks;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        validate::tag("java-version", &self.java_version)?;

        for task in &self.gradle_tasks {
            validate::gradle_task("gradle-tasks", task)?;
        }

        Ok(())
    }
}

/// A build plus where and as whom to publish its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub build: BuildRequest,
    pub registry: String,
    pub username: String,
    pub password: Secret,
    pub repository: String,
    pub image_name: String,
    pub image_tag: String,
}

impl PublishRequest {
    pub fn new(
        build: BuildRequest,
        username: &str,
        password: Secret,
        repository: &str,
        image_name: &str,
        image_tag: &str,
    ) -> Self {
        Self {
            build,
            registry: DEFAULT_REGISTRY.to_string(),
            username: username.to_string(),
            password,
            repository: repository.to_string(),
            image_name: image_name.to_string(),
            image_tag: image_tag.to_string(),
        }
    }

    pub fn registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }

    /// The reference the image is pushed to.
    pub fn address(&self) -> String {
        image_address(
            &self.registry,
            &self.repository,
            &self.image_name,
            &self.image_tag,
        )
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.build.validate()?;

        validate::registry_host("oci-registry", &self.registry)?;
        validate::not_empty("oci-username", &self.username)?;
        validate::repository("oci-registry-repository", &self.repository)?;
        validate::image_name("image-name", &self.image_name)?;
        validate::tag("image-tag", &self.image_tag)?;

        Ok(())
    }
}

/// Runs every gradle task, in order, against the source inside a JDK container and returns the resulting
/// working directory.
///
/// The first task to fail stops the build; later tasks are never started.
#[instrument(skip_all, fields(java_version = %request.java_version))]
pub async fn build(engine: &dyn Engine, request: &BuildRequest) -> Result<Directory, PipelineError> {
    request.validate()?;

    let mut container = engine.from_image(&jdk_image(&request.java_version)).await?;
    container = engine.with_workdir(container, WORKDIR).await?;
    container = engine.with_directory(container, WORKDIR, &request.src).await?;
    container = engine
        .with_exec(
            container,
            vec!["chmod".to_string(), "+x".to_string(), GRADLE_WRAPPER.to_string()],
        )
        .await
        .map_err(|e| task_error(SETUP_STEP, e))?;

    for task in &request.gradle_tasks {
        info!(task = %task, "Running gradle task");

        container = engine
            .with_exec(container, vec![format!("./{GRADLE_WRAPPER}"), task.clone()])
            .await
            .map_err(|e| task_error(task, e))?;
    }

    debug!(
        tasks = request.gradle_tasks.len(),
        "Gradle tasks finished; collecting build directory"
    );

    Ok(engine.directory(&container, WORKDIR).await?)
}

/// Builds the source and publishes the result layered onto a JRE image. Returns the published reference.
///
/// Only the build portion of the request is handed to the build step.
#[instrument(skip_all, fields(address = %request.address()))]
pub async fn publish(engine: &dyn Engine, request: &PublishRequest) -> Result<String, PipelineError> {
    request.validate()?;

    let built = build(engine, &request.build).await?;

    let container = engine
        .from_image(&jre_image(&request.build.java_version))
        .await?;
    let container = engine.with_directory(container, WORKDIR, &built).await?;
    let container = engine
        .with_registry_auth(
            container,
            &request.registry,
            &request.username,
            &request.password,
        )
        .await?;

    let published = engine.publish(container, &request.address()).await?;

    info!(published = %published, "Published gradle build");

    Ok(published)
}
