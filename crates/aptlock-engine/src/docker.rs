use crate::archive::{build_context, dockerfile_through};
use crate::engine::{
    BuildEngine, BuildRequest, ContainerSpec, ImageDetails, OutputStream, ProgressEvent,
    ProgressStream,
};
use crate::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, DownloadFromContainerOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::Docker;
use futures_util::{stream, StreamExt, TryStreamExt};
use tracing::debug;

/// [`BuildEngine`] backed by a Docker-compatible daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn map_error(err: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error;
    match err {
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        Error::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        Error::JsonDataError { message, .. } => EngineError::Decode(message),
        Error::JsonSerdeError { err } => EngineError::Decode(err.to_string()),
        Error::IOError { err } => EngineError::Io(err),
        Error::DockerStreamError { error } => EngineError::Rejected(error),
        other => EngineError::Transport(other.to_string()),
    }
}

/// The build context for `request`.
///
/// bollard 0.17's build options carry no `target` parameter, so a target
/// stage is selected by cutting the Dockerfile after it.
fn context_for(request: &BuildRequest) -> Result<Vec<u8>, EngineError> {
    match request.target.as_deref() {
        Some(target) => build_context(&dockerfile_through(&request.dockerfile, target)?),
        None => build_context(&request.dockerfile),
    }
}

fn progress_event(info: bollard::models::BuildInfo) -> ProgressEvent {
    let error = info
        .error
        .or_else(|| info.error_detail.and_then(|detail| detail.message));
    ProgressEvent {
        stream: info.stream,
        status: info.status,
        error,
        image_id: info.aux.and_then(|aux| aux.id),
    }
}

#[async_trait]
impl BuildEngine for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    fn build(&self, request: BuildRequest) -> ProgressStream<'_> {
        let context = match context_for(&request) {
            Ok(context) => context,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        debug!(tag = %request.tag, target = ?request.target, "starting image build");

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_owned(),
            t: request.tag,
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        self.docker
            .build_image(options, None, Some(context.into()))
            .map(|item| match item {
                Ok(info) => Ok(progress_event(info)),
                // The daemon reports failed steps in-band; keep those as step failures.
                Err(bollard::errors::Error::DockerStreamError { error }) => {
                    Ok(ProgressEvent::failure(error))
                }
                Err(e) => Err(map_error(e)),
            })
            .boxed()
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, EngineError> {
        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(map_error)?;
        Ok(ImageDetails {
            id: inspect.id.unwrap_or_default(),
            parent: inspect.parent.filter(|p| !p.is_empty()),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            attach_stdout: Some(spec.attach_output),
            attach_stderr: Some(spec.attach_output),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(map_error)?;
        for warning in &created.warnings {
            debug!(container_id = %created.id, %warning, "container create warning");
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn attach_stdout(&self, id: &str) -> Result<OutputStream, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let attached = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(map_error)?;
        let stdout = attached.output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) => Some(Ok(message)),
                Ok(LogOutput::StdErr { message }) => {
                    debug!(line = %String::from_utf8_lossy(&message).trim_end(), "container stderr");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(map_error(e))),
            }
        });
        Ok(stdout.boxed())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut waits = self.docker.wait_container(id, Some(options));
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as errors from the wait endpoint.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error(e)),
            None => Err(EngineError::Transport(format!(
                "wait stream for container {id} ended without a status"
            ))),
        }
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let options = DownloadFromContainerOptions { path };
        let chunks: Vec<_> = self
            .docker
            .download_from_container(id, Some(options))
            .map_err(map_error)
            .try_collect()
            .await?;
        Ok(chunks.concat())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn import_image(
        &self,
        reference: &str,
        rootfs: Bytes,
    ) -> Result<Option<String>, EngineError> {
        let options = CreateImageOptions {
            from_src: "-",
            repo: reference,
            ..Default::default()
        };
        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), Some(rootfs), None)
            .map_err(map_error)
            .try_collect()
            .await?;
        // The import reports the new image id as its last status.
        let image_id = progress
            .into_iter()
            .filter_map(|info| info.status)
            .rev()
            .find(|status| status.starts_with("sha256:"));
        debug!(reference, image_id = image_id.as_deref().unwrap_or("-"), "imported image");
        Ok(image_id)
    }
}
