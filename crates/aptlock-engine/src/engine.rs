use crate::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;

/// One build of a build specification up to an optional target stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Rendered build specification (Dockerfile text).
    pub dockerfile: String,
    /// Tag applied to the resulting image.
    pub tag: String,
    /// Stage to stop at. `None` builds the final stage.
    pub target: Option<String>,
}

/// A single decoded message from the build progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stream: Option<String>,
    pub status: Option<String>,
    /// Set when a build step failed. The build is over once this arrives.
    pub error: Option<String>,
    /// Image id reported by the engine once the build produced an image.
    pub image_id: Option<String>,
}

impl ProgressEvent {
    pub fn output(line: impl Into<String>) -> Self {
        Self {
            stream: Some(line.into()),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetails {
    pub id: String,
    /// Immediate parent image, if the engine reports one.
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Overrides the image entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    /// Attach stdout/stderr so output can be streamed after start.
    pub attach_output: bool,
}

pub type ProgressStream<'a> = BoxStream<'a, Result<ProgressEvent, EngineError>>;
pub type OutputStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Operations the executor needs from a container build engine.
///
/// Every call is a single round trip except `build`, whose stream must be
/// drained to completion by the caller. `create_container` is not idempotent
/// and must not be retried blindly.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, request: BuildRequest) -> ProgressStream<'_>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, EngineError>;

    /// Create (but do not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stream the container's stdout. Must be called before `start_container`
    /// to observe all output.
    async fn attach_stdout(&self, id: &str) -> Result<OutputStream, EngineError>;

    /// Block until the container stops. Returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Copy `path` out of a created or stopped container, as the engine's
    /// archive framing. Use [`crate::single_entry`] to unwrap it.
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Create an image named `reference` from a root filesystem tarball.
    /// Returns the engine's id for the new image, if it reports one.
    async fn import_image(&self, reference: &str, rootfs: Bytes) -> Result<Option<String>, EngineError>;
}
