use super::*;
use crate::engine::ContainerHandle;
use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    FromImage(String),
    WithWorkdir(String),
    WithDirectory(String, Directory),
    WithExec(Vec<String>),
    Directory(String),
    Publish {
        address: String,
        host: String,
        user: String,
        pass: String,
    },
}

/// An in-memory engine that records every call made against it.
///
/// Directories copied into a container are handed back unchanged by `directory`, since nothing here actually
/// runs gradle.
#[derive(Debug, Default)]
pub(crate) struct RecordingEngine {
    calls: Mutex<Vec<Call>>,
    generations: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    mounted: Mutex<HashMap<String, Directory>>,

    /// Exec commands that should fail, mapped to their exit code.
    failing_execs: HashMap<Vec<String>, i64>,

    /// When set, every publish is rejected with this message.
    failing_publish: Option<String>,

    cleaned_up: Mutex<bool>,
}

impl RecordingEngine {
    pub(crate) fn failing_task(task: &str, exit_code: i64) -> Self {
        Self {
            failing_execs: HashMap::from([(gradle_cmd(task), exit_code)]),
            ..Default::default()
        }
    }

    fn record(&self, call: Call, container: Option<&ContainerHandle>) {
        self.calls.lock().unwrap().push(call);
        if let Some(container) = container {
            self.generations.lock().unwrap().push(container.generation);
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn was_cleaned_up(&self) -> bool {
        *self.cleaned_up.lock().unwrap()
    }

    pub(crate) fn execs(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::WithExec(args) => Some(args),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn from_image(&self, image: &str) -> Result<ContainerHandle, EngineError> {
        self.record(Call::FromImage(image.to_string()), None);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerHandle::new(&format!("container-{id}"), image))
    }

    async fn with_workdir(
        &self,
        container: ContainerHandle,
        path: &str,
    ) -> Result<ContainerHandle, EngineError> {
        self.record(Call::WithWorkdir(path.to_string()), Some(&container));
        Ok(container.workdir(path).next())
    }

    async fn with_directory(
        &self,
        container: ContainerHandle,
        path: &str,
        directory: &Directory,
    ) -> Result<ContainerHandle, EngineError> {
        self.record(
            Call::WithDirectory(path.to_string(), directory.clone()),
            Some(&container),
        );
        self.mounted
            .lock()
            .unwrap()
            .insert(container.id.clone(), directory.clone());
        Ok(container.next())
    }

    async fn with_exec(
        &self,
        container: ContainerHandle,
        args: Vec<String>,
    ) -> Result<ContainerHandle, EngineError> {
        self.record(Call::WithExec(args.clone()), Some(&container));

        if let Some(exit_code) = self.failing_execs.get(&args) {
            return Err(EngineError::ExecFailed {
                command: args.clone(),
                exit_code: *exit_code,
                output: format!("FAILURE: Build failed with an exception.\n> {}", args.join(" ")),
            });
        }

        Ok(container.next())
    }

    async fn directory(
        &self,
        container: &ContainerHandle,
        path: &str,
    ) -> Result<Directory, EngineError> {
        self.record(Call::Directory(path.to_string()), Some(container));

        Ok(self
            .mounted
            .lock()
            .unwrap()
            .get(&container.id)
            .cloned()
            .unwrap_or(Directory::Archive(Bytes::new())))
    }

    async fn publish(
        &self,
        container: ContainerHandle,
        address: &str,
    ) -> Result<String, EngineError> {
        let auth = container.registry_auth.as_ref();
        self.record(
            Call::Publish {
                address: address.to_string(),
                host: auth.map(|auth| auth.host.clone()).unwrap_or_default(),
                user: auth.map(|auth| auth.user.clone()).unwrap_or_default(),
                pass: auth
                    .map(|auth| auth.pass.expose().to_string())
                    .unwrap_or_default(),
            },
            Some(&container),
        );

        if let Some(message) = &self.failing_publish {
            return Err(EngineError::Push(message.clone()));
        }

        Ok(address.to_string())
    }

    async fn cleanup(&self) -> Result<(), EngineError> {
        *self.cleaned_up.lock().unwrap() = true;
        Ok(())
    }
}

fn gradle_cmd(task: &str) -> Vec<String> {
    vec!["./gradlew".to_string(), task.to_string()]
}

fn chmod_cmd() -> Vec<String> {
    vec!["chmod".to_string(), "+x".to_string(), "gradlew".to_string()]
}

fn src() -> Directory {
    Directory::Host(PathBuf::from("/src/project"))
}

fn tasks(tasks: &[&str]) -> Vec<String> {
    tasks.iter().map(|task| task.to_string()).collect()
}

fn publish_request(build: BuildRequest, password_env: &str) -> PublishRequest {
    PublishRequest::new(
        build,
        "acme-bot",
        Secret::Env(password_env.to_string()),
        "acme",
        "svc",
        "v1",
    )
}

#[tokio::test]
async fn build_calls_engine_in_order() {
    let engine = RecordingEngine::default();
    let request = BuildRequest::new(src())
        .java_version("21")
        .gradle_tasks(tasks(&["clean", "build"]));

    let output = build(&engine, &request).await.unwrap();

    assert_eq!(
        engine.calls(),
        vec![
            Call::FromImage("eclipse-temurin:21".into()),
            Call::WithWorkdir("/app".into()),
            Call::WithDirectory("/app".into(), src()),
            Call::WithExec(chmod_cmd()),
            Call::WithExec(gradle_cmd("clean")),
            Call::WithExec(gradle_cmd("build")),
            Call::Directory("/app".into()),
        ]
    );
    assert_eq!(output, src());
}

#[tokio::test]
/// Every step must see the state produced by the one before it.
async fn build_threads_container_state_through_steps() {
    let engine = RecordingEngine::default();
    let request = BuildRequest::new(src()).gradle_tasks(tasks(&["a", "b", "c"]));

    build(&engine, &request).await.unwrap();

    let generations = engine.generations.lock().unwrap().clone();
    assert_eq!(generations, (0..generations.len() as u64).collect::<Vec<_>>());
}

#[rstest]
#[case::forward(&["downloadRepos", "installDist"])]
#[case::reversed(&["installDist", "downloadRepos"])]
#[case::repeated(&["clean", "build", "clean"])]
#[case::single(&["test"])]
#[tokio::test]
async fn build_runs_tasks_in_given_order(#[case] order: &[&str]) {
    let engine = RecordingEngine::default();
    let request = BuildRequest::new(src()).gradle_tasks(tasks(order));

    build(&engine, &request).await.unwrap();

    let mut expected = vec![chmod_cmd()];
    expected.extend(order.iter().map(|task| gradle_cmd(task)));

    assert_eq!(engine.execs(), expected);
}

#[tokio::test]
async fn build_without_tasks_returns_source_unmodified() {
    let engine = RecordingEngine::default();
    let request = BuildRequest::new(src());

    let output = build(&engine, &request).await.unwrap();

    assert_eq!(output, src());
    assert_eq!(engine.execs(), vec![chmod_cmd()]);
}

#[tokio::test]
async fn build_uses_default_java_version() {
    let engine = RecordingEngine::default();

    build(&engine, &BuildRequest::new(src())).await.unwrap();

    assert_eq!(
        engine.calls().first(),
        Some(&Call::FromImage("eclipse-temurin:21".into()))
    );
}

#[tokio::test]
async fn build_stops_at_first_failed_task() {
    let engine = RecordingEngine::failing_task("test", 1);
    let request = BuildRequest::new(src()).gradle_tasks(tasks(&["compileJava", "test", "installDist"]));

    let err = build(&engine, &request).await.unwrap_err();

    match err {
        PipelineError::Task {
            task,
            exit_code,
            output,
        } => {
            assert_eq!(task, "test");
            assert_eq!(exit_code, 1);
            assert!(output.contains("./gradlew test"));
        }
        other => panic!("expected task failure, got {other:?}"),
    }

    assert_eq!(
        engine.execs(),
        vec![chmod_cmd(), gradle_cmd("compileJava"), gradle_cmd("test")]
    );
    assert!(!engine.calls().contains(&Call::Directory("/app".into())));
}

#[tokio::test]
async fn build_reports_wrapper_setup_failure() {
    let engine = RecordingEngine {
        failing_execs: HashMap::from([(chmod_cmd(), 1)]),
        ..Default::default()
    };
    let request = BuildRequest::new(src()).gradle_tasks(tasks(&["build"]));

    let err = build(&engine, &request).await.unwrap_err();

    assert!(matches!(err, PipelineError::Task { ref task, .. } if task == SETUP_STEP));
    assert_eq!(engine.execs(), vec![chmod_cmd()]);
}

#[tokio::test]
async fn build_rejects_invalid_arguments_before_touching_engine() {
    let engine = RecordingEngine::default();
    let request = BuildRequest::new(src())
        .java_version("21 jre")
        .gradle_tasks(tasks(&["build"]));

    let err = build(&engine, &request).await.unwrap_err();

    assert!(matches!(err, PipelineError::InvalidArgument { ref argument, .. } if argument == "java-version"));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn publish_pushes_to_composed_address() {
    std::env::set_var("GRADLE_OCI_TEST_PUBLISH_ADDRESS", "token");

    let engine = RecordingEngine::default();
    let request = publish_request(
        BuildRequest::new(src()).gradle_tasks(tasks(&["installDist"])),
        "GRADLE_OCI_TEST_PUBLISH_ADDRESS",
    )
    .registry("docker.io");

    let published = publish(&engine, &request).await.unwrap();

    assert_eq!(published, "docker.io/acme/svc:v1");

    std::env::remove_var("GRADLE_OCI_TEST_PUBLISH_ADDRESS");
}

#[tokio::test]
async fn publish_layers_build_output_onto_jre_image() {
    std::env::set_var("GRADLE_OCI_TEST_PUBLISH_LAYERS", "token");

    let engine = RecordingEngine::default();
    let request = publish_request(
        BuildRequest::new(src())
            .java_version("17")
            .gradle_tasks(tasks(&["installDist"])),
        "GRADLE_OCI_TEST_PUBLISH_LAYERS",
    )
    .registry("ghcr.io");

    publish(&engine, &request).await.unwrap();

    let calls = engine.calls();
    let publish_calls = &calls[calls.len() - 3..];

    assert_eq!(
        publish_calls,
        &[
            Call::FromImage("eclipse-temurin:17-jre".into()),
            Call::WithDirectory("/app".into(), src()),
            Call::Publish {
                address: "ghcr.io/acme/svc:v1".into(),
                host: "ghcr.io".into(),
                user: "acme-bot".into(),
                pass: "token".into(),
            },
        ]
    );

    std::env::remove_var("GRADLE_OCI_TEST_PUBLISH_LAYERS");
}

#[tokio::test]
/// The build half of a publish must be indistinguishable from a plain build of the same shared fields.
async fn publish_builds_with_shared_fields_only() {
    std::env::set_var("GRADLE_OCI_TEST_PUBLISH_SHARED", "token");

    let build_request = BuildRequest::new(src())
        .java_version("17")
        .gradle_tasks(tasks(&["clean", "installDist"]));

    let build_engine = RecordingEngine::default();
    build(&build_engine, &build_request).await.unwrap();
    let build_calls = build_engine.calls();

    let publish_engine = RecordingEngine::default();
    let request = publish_request(build_request, "GRADLE_OCI_TEST_PUBLISH_SHARED");
    publish(&publish_engine, &request).await.unwrap();
    let publish_calls = publish_engine.calls();

    assert_eq!(&publish_calls[..build_calls.len()], build_calls.as_slice());

    std::env::remove_var("GRADLE_OCI_TEST_PUBLISH_SHARED");
}

#[tokio::test]
async fn publish_stops_when_build_fails() {
    let engine = RecordingEngine::failing_task("build", 2);
    let request = publish_request(
        BuildRequest::new(src()).gradle_tasks(tasks(&["build"])),
        "GRADLE_OCI_TEST_PUBLISH_BUILD_FAILS",
    );

    let err = publish(&engine, &request).await.unwrap_err();

    assert!(matches!(err, PipelineError::Task { ref task, exit_code: 2, .. } if task == "build"));
    assert!(!engine
        .calls()
        .contains(&Call::FromImage("eclipse-temurin:21-jre".into())));
}

#[tokio::test]
async fn publish_propagates_push_failure() {
    std::env::set_var("GRADLE_OCI_TEST_PUBLISH_PUSH_FAILS", "token");

    let engine = RecordingEngine {
        failing_publish: Some("denied: requested access to the resource is denied".into()),
        ..Default::default()
    };
    let request = publish_request(BuildRequest::new(src()), "GRADLE_OCI_TEST_PUBLISH_PUSH_FAILS");

    let err = publish(&engine, &request).await.unwrap_err();

    assert_eq!(
        err,
        PipelineError::Engine(EngineError::Push(
            "denied: requested access to the resource is denied".into()
        ))
    );

    std::env::remove_var("GRADLE_OCI_TEST_PUBLISH_PUSH_FAILS");
}

#[tokio::test]
async fn publish_resolves_password_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let token = dir.path().join("token");
    std::fs::write(&token, "file-token\n").unwrap();

    let engine = RecordingEngine::default();
    let request = PublishRequest::new(
        BuildRequest::new(src()),
        "acme-bot",
        Secret::File(token),
        "acme",
        "svc",
        "v1",
    );

    publish(&engine, &request).await.unwrap();

    assert_eq!(
        engine.calls().last(),
        Some(&Call::Publish {
            address: "docker.io/acme/svc:v1".into(),
            host: "docker.io".into(),
            user: "acme-bot".into(),
            pass: "file-token".into(),
        })
    );
}

#[tokio::test]
async fn publish_fails_when_password_cannot_be_resolved() {
    let engine = RecordingEngine::default();
    let request = publish_request(BuildRequest::new(src()), "GRADLE_OCI_TEST_PUBLISH_NEVER_SET");

    let err = publish(&engine, &request).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Engine(EngineError::Authentication(_))
    ));
    assert!(!engine
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Publish { .. })));
}

#[tokio::test]
async fn publish_rejects_invalid_destination_before_building() {
    let engine = RecordingEngine::default();
    let request = PublishRequest::new(
        BuildRequest::new(src()).gradle_tasks(tasks(&["build"])),
        "acme-bot",
        Secret::Env("GRADLE_OCI_TEST_PUBLISH_INVALID".into()),
        "Acme",
        "svc",
        "v1",
    );

    let err = publish(&engine, &request).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::InvalidArgument { ref argument, .. } if argument == "oci-registry-repository"
    ));
    assert!(engine.calls().is_empty());
}

#[test]
fn image_naming() {
    assert_eq!(jdk_image("21"), "eclipse-temurin:21");
    assert_eq!(jre_image("21"), "eclipse-temurin:21-jre");
    assert_eq!(
        image_address("docker.io", "acme", "svc", "v1"),
        "docker.io/acme/svc:v1"
    );
}
