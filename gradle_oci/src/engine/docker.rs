use super::{ContainerHandle, EngineError};
use crate::conf;
use crate::directory::{self, Directory};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions, ListImagesOptions, PushImageOptions};
use dashmap::DashMap;
use futures::stream::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// The parts of an image's configuration that we override to keep a container alive and need to put back
/// before the container is committed.
#[derive(Debug, Clone, Default)]
struct ImageDefaults {
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Docker {
    client: bollard::Docker,
    always_pull: bool,
    keep_containers: bool,

    /// Every container created by this engine, mapped to the defaults of the image it was created from.
    ///
    /// Map takes in <ContainerID, ImageDefaults>
    containers: Arc<DashMap<String, ImageDefaults>>,
}

impl Docker {
    #[instrument(skip_all, fields(origin = "engine::docker"))]
    pub async fn new(config: &conf::DockerEngine) -> Result<Self, EngineError> {
        let client = bollard::Docker::connect_with_socket_defaults().map_err(|e| {
            EngineError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;
        let client = client.with_timeout(tokio::time::Duration::from_secs(config.timeout));

        // Check that we can actually get a connection.
        let version = client.version().await.map_err(|e| {
            EngineError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        debug!(
            version = version.version.unwrap_or_default(),
            "Local docker engine successfully connected"
        );

        Ok(Self {
            client,
            always_pull: config.always_pull,
            keep_containers: config.keep_containers,
            containers: Arc::new(DashMap::new()),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        if !self.always_pull {
            let mut filters = HashMap::new();
            filters.insert("reference".to_string(), vec![image.to_string()]);

            let images = self
                .client
                .list_images(Some(ListImagesOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| EngineError::Unknown(e.to_string()))?;

            if !images.is_empty() {
                trace!(image, "image already present; skipping pull");
                return Ok(());
            }
        }

        info!(image, "Pulling image");

        self.client
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| EngineError::NoSuchImage(format!("{image}; {e}")))?;

        Ok(())
    }

    /// Runs a process to completion inside the container and returns its combined output.
    async fn exec(
        &self,
        container: &ContainerHandle,
        working_dir: Option<&str>,
        args: Vec<String>,
    ) -> Result<String, EngineError> {
        let create_exec_options = CreateExecOptions::<String> {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(args.clone()),
            working_dir: working_dir.map(|dir| dir.to_string()),
            ..Default::default()
        };

        let created = self
            .client
            .create_exec(&container.id, create_exec_options)
            .await
            .map_err(|e| {
                EngineError::Unknown(format!("could not create exec for container; {e}"))
            })?;

        let started = self
            .client
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                EngineError::Unknown(format!("could not attach to exec for container; {e}"))
            })?;

        let mut output = String::new();

        match started {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(log) = stream.next().await {
                    let message = match log.map_err(|e| EngineError::Unknown(e.to_string()))? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => message,
                        LogOutput::StdIn { .. } => continue,
                    };

                    let message = String::from_utf8_lossy(&message);
                    for line in message.lines() {
                        debug!(container_id = %container.id, "{}", line);
                    }
                    output.push_str(&message);
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Unknown(
                    "could not properly attach to exec".into(),
                ))
            }
        }

        let inspected = self
            .client
            .inspect_exec(&created.id)
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        let exit_code = exit_status(inspected.running, inspected.exit_code)?;
        if exit_code != 0 {
            return Err(EngineError::ExecFailed {
                command: args,
                exit_code,
                output,
            });
        }

        Ok(output)
    }

    /// Creates a directory (and its parents) from the container's root, so it works before the directory that
    /// commands normally run in exists.
    async fn make_dir(&self, container: &ContainerHandle, path: &str) -> Result<(), EngineError> {
        self.exec(
            container,
            Some("/"),
            vec!["mkdir".to_string(), "-p".to_string(), path.to_string()],
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl super::Engine for Docker {
    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn from_image(&self, image: &str) -> Result<ContainerHandle, EngineError> {
        self.pull_image(image).await?;

        let inspected = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| EngineError::NoSuchImage(format!("{image}; {e}")))?;

        let defaults = inspected
            .config
            .map(|config| ImageDefaults {
                entrypoint: config.entrypoint,
                cmd: config.cmd,
            })
            .unwrap_or_default();

        let name = format!("gradle-oci-{}", uuid::Uuid::now_v7());

        let container_config = keep_alive_config(image);

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        self.containers.insert(created.id.clone(), defaults);

        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        debug!(container_id = %created.id, name = %name, "Started container");

        Ok(ContainerHandle::new(&created.id, image))
    }

    #[instrument(skip(self), fields(origin = "engine::docker", container_id = %container.id))]
    async fn with_workdir(
        &self,
        container: ContainerHandle,
        path: &str,
    ) -> Result<ContainerHandle, EngineError> {
        self.make_dir(&container, path).await?;
        Ok(container.workdir(path).next())
    }

    #[instrument(skip(self, directory), fields(origin = "engine::docker", container_id = %container.id))]
    async fn with_directory(
        &self,
        container: ContainerHandle,
        path: &str,
        directory: &Directory,
    ) -> Result<ContainerHandle, EngineError> {
        // Uploads are rejected if the destination doesn't exist yet.
        self.make_dir(&container, path).await?;

        let archive = directory.to_archive()?;

        self.client
            .upload_to_container(
                &container.id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| EngineError::Io(format!("could not copy directory to '{path}'; {e}")))?;

        Ok(container.next())
    }

    #[instrument(skip(self), fields(origin = "engine::docker", container_id = %container.id))]
    async fn with_exec(
        &self,
        container: ContainerHandle,
        args: Vec<String>,
    ) -> Result<ContainerHandle, EngineError> {
        self.exec(&container, container.workdir.as_deref(), args)
            .await?;
        Ok(container.next())
    }

    #[instrument(skip(self), fields(origin = "engine::docker", container_id = %container.id))]
    async fn directory(
        &self,
        container: &ContainerHandle,
        path: &str,
    ) -> Result<Directory, EngineError> {
        let archive = self
            .client
            .download_from_container(
                &container.id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .try_fold(Vec::new(), |mut archive, chunk| async move {
                archive.extend_from_slice(&chunk);
                Ok(archive)
            })
            .await
            .map_err(|e| EngineError::Io(format!("could not copy directory from '{path}'; {e}")))?;

        // Docker roots the archive at the basename of the requested path.
        let archive = directory::strip_root(&archive)?;

        Ok(Directory::Archive(archive))
    }

    #[instrument(skip(self), fields(origin = "engine::docker", container_id = %container.id))]
    async fn publish(
        &self,
        container: ContainerHandle,
        address: &str,
    ) -> Result<String, EngineError> {
        let (repository, tag) = split_reference(address);

        let defaults = self
            .containers
            .get(&container.id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let image_config = commit_config(defaults, container.workdir.clone());

        self.client
            .commit_container(
                CommitContainerOptions {
                    container: container.id.clone(),
                    repo: repository.to_string(),
                    tag: tag.to_string(),
                    pause: true,
                    ..Default::default()
                },
                image_config,
            )
            .await
            .map_err(|e| EngineError::Unknown(format!("could not commit container; {e}")))?;

        debug!(image = %container.image, repository, tag, "Committed container");

        let credentials = container.registry_auth.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.user.clone()),
            password: Some(auth.pass.expose().to_string()),
            serveraddress: Some(auth.host.clone()),
            ..Default::default()
        });

        let mut pushed = self.client.push_image(
            repository,
            Some(PushImageOptions { tag }),
            credentials,
        );

        let mut digest = None;

        while let Some(info) = pushed.next().await {
            let info = info.map_err(|e| classify_push_error(&e.to_string()))?;

            if let Some(error) = info.error {
                return Err(classify_push_error(&error));
            }

            if let Some(status) = info.status {
                trace!(status = %status, "push progress");
                if let Some(found) = parse_digest(&status) {
                    digest = Some(found);
                }
            }
        }

        let published = match digest {
            Some(digest) => format!("{address}@{digest}"),
            None => address.to_string(),
        };

        info!(address = %published, "Published image");

        Ok(published)
    }

    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn cleanup(&self) -> Result<(), EngineError> {
        let ids: Vec<String> = self
            .containers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        if self.keep_containers {
            info!(containers = ?ids, "Keeping containers");
            return Ok(());
        }

        let mut last_error = None;

        for id in ids {
            match self
                .client
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        v: true,
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(_) => {
                    self.containers.remove(&id);
                    debug!(container_id = %id, "Removed container");
                }
                Err(e) => {
                    warn!(container_id = %id, err = ?e, "could not remove container");
                    last_error = Some(EngineError::Unknown(e.to_string()));
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The container needs a process that outlives every step so we can exec into it. The whole keep-alive
/// command lives in the entrypoint and the cmd is left unset, so nothing of it survives the commit merge
/// once the image's own entrypoint and cmd are put back.
fn keep_alive_config(image: &str) -> Config<String> {
    Config {
        image: Some(image.to_string()),
        entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        ..Default::default()
    }
}

/// The configuration a container is committed with. Docker fills in any field left unset from the container,
/// so entrypoint and cmd are always sent, empty when the base image had none.
fn commit_config(defaults: ImageDefaults, working_dir: Option<String>) -> Config<String> {
    Config {
        entrypoint: Some(defaults.entrypoint.unwrap_or_default()),
        cmd: Some(defaults.cmd.unwrap_or_default()),
        working_dir,
        ..Default::default()
    }
}

/// An exec that hasn't reported an exit code can't be counted as a success.
fn exit_status(running: Option<bool>, exit_code: Option<i64>) -> Result<i64, EngineError> {
    match (running, exit_code) {
        (Some(true), _) => Err(EngineError::Unknown(
            "exec was still running after its output closed".into(),
        )),
        (_, Some(exit_code)) => Ok(exit_code),
        (_, None) => Err(EngineError::Unknown(
            "exec finished without reporting an exit code".into(),
        )),
    }
}

/// Splits an image reference into repository and tag. References without a tag default to "latest".
fn split_reference(address: &str) -> (&str, &str) {
    match address.rsplit_once(':') {
        // A colon before the last slash belongs to the registry port.
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (address, "latest"),
    }
}

/// Pulls the digest out of the final status line docker emits for a push,
/// e.g. "v1: digest: sha256:abc... size: 1234".
fn parse_digest(status: &str) -> Option<String> {
    let (_, rest) = status.split_once("digest: ")?;
    let digest = rest.split_whitespace().next()?;

    if digest.contains(':') {
        Some(digest.to_string())
    } else {
        None
    }
}

fn classify_push_error(message: &str) -> EngineError {
    let lowered = message.to_lowercase();

    if lowered.contains("unauthorized")
        || lowered.contains("authentication required")
        || lowered.contains("incorrect username or password")
    {
        EngineError::Authentication(message.to_string())
    } else {
        EngineError::Push(message.to_string())
    }
}
