mod docker;

use crate::conf;
use crate::directory::{Directory, DirectoryError};
use crate::secret::{Secret, SecretValue};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different container engine failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Failed to start the engine due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init container engine; {0}")]
    FailedPrecondition(String),

    /// Failed to communicate with the engine due to network error or other.
    #[error("could not connect to container engine; {0}")]
    Connection(String),

    /// Image requested by reference could not be found or pulled.
    #[error("image not found; {0}")]
    NoSuchImage(String),

    /// A process run inside the container exited with a non-zero code.
    #[error("command {command:?} exited with code {exit_code}")]
    ExecFailed {
        command: Vec<String>,
        exit_code: i64,
        output: String,
    },

    /// The registry rejected the supplied credentials or the credentials could not be resolved.
    #[error("could not authenticate with registry; {0}")]
    Authentication(String),

    /// The registry refused the image for reasons other than authentication.
    #[error("could not push image; {0}")]
    Push(String),

    /// Copying a directory in or out of a container failed.
    #[error("could not transfer directory; {0}")]
    Io(String),

    /// An expected and unknown error has occurred.
    #[error("unexpected container engine error occurred; {0}")]
    Unknown(String),
}

impl From<DirectoryError> for EngineError {
    fn from(e: DirectoryError) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// Credentials attached to a container for the moment it gets pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub host: String,
    pub user: String,
    pub pass: SecretValue,
}

/// An opaque reference to a single state of a container.
///
/// Handles are never mutated in place. Every engine operation that changes the container consumes the handle
/// it was given and returns a new one, so a step can only ever build on the state produced by the step before it.
#[derive(Debug, PartialEq, Eq)]
pub struct ContainerHandle {
    /// The engine's identifier for the underlying container.
    pub id: String,

    /// The image reference this container was created from.
    pub image: String,

    /// Directory commands are executed in. None means the image default.
    pub workdir: Option<String>,

    /// Registry credentials to use when this container is published.
    pub registry_auth: Option<RegistryAuth>,

    /// Incremented on every step.
    pub generation: u64,
}

impl ContainerHandle {
    pub fn new(id: &str, image: &str) -> Self {
        Self {
            id: id.to_string(),
            image: image.to_string(),
            workdir: None,
            registry_auth: None,
            generation: 0,
        }
    }

    /// Produces the handle for the next container state, consuming this one.
    pub fn next(self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self
        }
    }

    pub fn workdir(mut self, path: &str) -> Self {
        self.workdir = Some(path.to_string());
        self
    }

    pub fn registry_auth(mut self, auth: RegistryAuth) -> Self {
        self.registry_auth = Some(auth);
        self
    }
}

/// The engine trait defines what the interface between the pipelines and a container engine should look like.
///
/// An engine is always passed explicitly into a pipeline, there is no process wide client.
#[async_trait]
pub trait Engine: Debug + Send + Sync {
    /// Create a container from the given image reference. Should implement automatically pulling the image
    /// if it isn't available locally.
    async fn from_image(&self, image: &str) -> Result<ContainerHandle, EngineError>;

    /// Set the directory that subsequent commands run in.
    async fn with_workdir(
        &self,
        container: ContainerHandle,
        path: &str,
    ) -> Result<ContainerHandle, EngineError> {
        Ok(container.workdir(path).next())
    }

    /// Copy the contents of a directory into the container at the given path.
    async fn with_directory(
        &self,
        container: ContainerHandle,
        path: &str,
        directory: &Directory,
    ) -> Result<ContainerHandle, EngineError>;

    /// Run a command in the container. A non-zero exit code must be returned as [`EngineError::ExecFailed`].
    async fn with_exec(
        &self,
        container: ContainerHandle,
        args: Vec<String>,
    ) -> Result<ContainerHandle, EngineError>;

    /// Snapshot the contents of a directory within the container.
    async fn directory(
        &self,
        container: &ContainerHandle,
        path: &str,
    ) -> Result<Directory, EngineError>;

    /// Attach registry credentials to the container. The secret is resolved here and nowhere earlier.
    async fn with_registry_auth(
        &self,
        container: ContainerHandle,
        host: &str,
        username: &str,
        secret: &Secret,
    ) -> Result<ContainerHandle, EngineError> {
        // Resolving may block on a file or stdin.
        let secret = secret.clone();
        let pass = tokio::task::spawn_blocking(move || secret.resolve())
            .await
            .map_err(|e| EngineError::Unknown(format!("could not resolve registry password; {e}")))?
            .map_err(|e| {
                EngineError::Authentication(format!("could not resolve registry password; {e}"))
            })?;

        Ok(container
            .registry_auth(RegistryAuth {
                host: host.to_string(),
                user: username.to_string(),
                pass,
            })
            .next())
    }

    /// Turn the container state into an image and push it to the given address. Returns the published reference,
    /// qualified by digest when the registry reports one.
    async fn publish(&self, container: ContainerHandle, address: &str)
        -> Result<String, EngineError>;

    /// Release every resource created by this engine. Safe to call more than once.
    async fn cleanup(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Docker,
}

pub async fn init_engine(config: &conf::Engine) -> Result<Arc<dyn Engine>, EngineError> {
    #[allow(clippy::match_single_binding)]
    match config.kind {
        EngineKind::Docker => {
            if let Some(config) = &config.docker {
                let engine = docker::Docker::new(config).await?;
                Ok(Arc::new(engine))
            } else {
                Err(EngineError::FailedPrecondition(
                    "docker engine settings not found in config".into(),
                ))
            }
        }
    }
}
