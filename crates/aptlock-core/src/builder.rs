//! Build executor: drives a [`BuildEngine`] through a generated specification.
//!
//! Each public operation runs under one overall deadline, checked at every
//! engine round trip. Containers created along the way are always removed,
//! including when the operation future is dropped part way through; those
//! late removals run as tasks that [`Builder::finish_cleanup`] waits for.

use crate::buildspec::{generate, GenerateOptions, DEB_HASHES_PATH, INSTALLED_LIST_PATH, MANIFEST_STAGE};
use crate::config::BuilderConfig;
use crate::extract::{assemble_lock, read_artifact, Extraction};
use crate::progress::{drain, BuildSummary};
use crate::{CoreError, Phase};
use aptlock_engine::{BuildEngine, BuildRequest, ContainerSpec, EngineError};
use aptlock_schema::{Lock, Manifest};
use bytes::Bytes;
use futures_util::{future, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Namespace for images produced by [`Builder::build`].
pub const BUILD_TAG_PREFIX: &str = "aptlock-build";
/// Namespace for introspection images produced by [`Builder::lock`].
pub const MANIFEST_TAG_PREFIX: &str = "aptlock-manifest";

/// Upper bound on container removal, which may run after the deadline.
const CLEANUP_GRACE: Duration = Duration::from_secs(10);

/// Writes the bootstrapped root filesystem to stdout as a tar stream.
const EXPORT_ENTRYPOINT: [&str; 3] = ["sh", "-c", "tar -C $ROOTFS_PATH -c ."];

pub fn build_tag(manifest: &Manifest) -> String {
    format!("{BUILD_TAG_PREFIX}/{}", manifest.image)
}

pub fn manifest_tag(manifest: &Manifest) -> String {
    format!("{MANIFEST_TAG_PREFIX}/{}", manifest.image)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderOptions {
    pub generate: GenerateOptions,
    /// Overall deadline for one operation.
    pub timeout: Duration,
    /// Echo build output to stderr as it arrives.
    pub echo_progress: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        BuilderOptions::from(&BuilderConfig::default())
    }
}

impl From<&BuilderConfig> for BuilderOptions {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            generate: config.generate_options(),
            timeout: config.timeout(),
            echo_progress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildOutcome {
    pub tag: String,
    pub image_id: Option<String>,
    pub output_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    /// Build image the root filesystem was taken from.
    pub tag: String,
    /// Reference the root filesystem was imported under.
    pub image: String,
    pub image_id: Option<String>,
    /// Where the tarball was also written, if requested.
    pub path: Option<PathBuf>,
    pub bytes: u64,
}

pub struct Builder {
    engine: Arc<dyn BuildEngine>,
    options: BuilderOptions,
    pending: Arc<PendingCleanup>,
}

impl Builder {
    pub fn new(engine: Arc<dyn BuildEngine>, options: BuilderOptions) -> Self {
        Self {
            engine,
            options,
            pending: Arc::default(),
        }
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// Wait up to `grace` for container removals started by dropped operations.
    ///
    /// Call this after cancelling an operation and before shutting the runtime
    /// down, or those removals are aborted with the runtime.
    pub async fn finish_cleanup(&self, grace: Duration) {
        let handles = self.pending.take();
        if handles.is_empty() {
            return;
        }
        info!(containers = handles.len(), "waiting for container cleanup");
        if tokio::time::timeout(grace, future::join_all(handles))
            .await
            .is_err()
        {
            warn!(after_secs = grace.as_secs(), "container cleanup did not finish");
        }
    }

    /// Generate the build specification for `manifest`, pinned by `lock`.
    pub fn dockerfile(&self, manifest: &Manifest, lock: Option<&Lock>) -> Result<String, CoreError> {
        let dockerfile = generate(manifest, lock, &self.options.generate)?;
        debug!(image = %manifest.image, %dockerfile, "generated build specification");
        Ok(dockerfile)
    }

    /// Build the final image, tagged `aptlock-build/<image>`.
    pub async fn build(
        &self,
        manifest: &Manifest,
        lock: Option<&Lock>,
    ) -> Result<BuildOutcome, CoreError> {
        let deadline = Deadline::start(self.options.timeout);
        self.build_target(manifest, lock, None, build_tag(manifest), &deadline)
            .await
    }

    /// Build the introspection stage and assemble a fresh lock from it.
    ///
    /// The lock's base image is `<family>@<parent>`, where `<parent>` is the
    /// immediate parent the engine reports for the introspection image. That
    /// assumes a single-parent history produced by this builder; an image
    /// built some other way may report a parent that is not the base.
    pub async fn lock(
        &self,
        manifest: &Manifest,
        lock: Option<&Lock>,
    ) -> Result<Extraction, CoreError> {
        let deadline = Deadline::start(self.options.timeout);
        let tag = manifest_tag(manifest);
        self.build_target(manifest, lock, Some(MANIFEST_STAGE), tag.clone(), &deadline)
            .await?;

        let details = deadline
            .run(Phase::Inspect, async {
                self.engine
                    .inspect_image(&tag)
                    .await
                    .map_err(|source| CoreError::Inspect {
                        image: tag.clone(),
                        source,
                    })
            })
            .await?;
        let parent = details
            .parent
            .ok_or_else(|| CoreError::MissingParent { image: tag.clone() })?;
        let pinned = format!("{}@{parent}", self.options.generate.base_family);
        debug!(%tag, image_id = %details.id, %pinned, "pinned base image");

        let spec = ContainerSpec {
            image: tag.clone(),
            ..ContainerSpec::default()
        };
        let guard = deadline
            .run(Phase::ExtractLock, async {
                self.create(&spec)
                    .await
                    .map_err(|source| CoreError::CreateContainer {
                        image: tag.clone(),
                        source,
                    })
            })
            .await?;

        let artifacts = self.read_artifacts(guard.id(), &deadline).await;
        guard.release().await;
        let (installed, hashes) = artifacts?;

        let extraction = assemble_lock(
            &pinned,
            &String::from_utf8_lossy(&installed),
            &String::from_utf8_lossy(&hashes),
        );
        for package in extraction.lock.missing_from(manifest) {
            warn!(%package, "requested package not found in resolved set");
        }
        info!(
            image = %manifest.image,
            packages = extraction.lock.package_count(),
            hashed = extraction.lock.hashed_packages().count(),
            "resolved lock"
        );
        Ok(extraction)
    }

    /// Build the final image, then import its bootstrapped root filesystem
    /// as a single-layer image named after the manifest's `image`.
    ///
    /// With `output`, the tarball is also written there.
    pub async fn export(
        &self,
        manifest: &Manifest,
        lock: Option<&Lock>,
        output: Option<&Path>,
    ) -> Result<ExportOutcome, CoreError> {
        let deadline = Deadline::start(self.options.timeout);
        let tag = build_tag(manifest);
        self.build_target(manifest, lock, None, tag.clone(), &deadline)
            .await?;

        let spec = ContainerSpec {
            image: tag.clone(),
            entrypoint: Some(EXPORT_ENTRYPOINT.iter().map(|s| (*s).to_owned()).collect()),
            attach_output: true,
        };
        let guard = deadline
            .run(Phase::Export, async {
                self.create(&spec).await.map_err(|source| CoreError::Export {
                    context: format!("creating container from {tag}"),
                    source,
                })
            })
            .await?;

        let streamed = deadline
            .run(Phase::Export, self.stream_rootfs(guard.id()))
            .await;
        guard.release().await;
        let rootfs = streamed?;
        let bytes = rootfs.len() as u64;

        if let Some(output) = output {
            write_tarball(output, &rootfs)?;
            info!(path = %output.display(), bytes, "wrote root filesystem tarball");
        }

        let image = manifest.image.clone();
        let image_id = deadline
            .run(Phase::Export, async {
                self.engine
                    .import_image(&image, rootfs)
                    .await
                    .map_err(|source| CoreError::Export {
                        context: format!("importing root filesystem as {image}"),
                        source,
                    })
            })
            .await?;

        info!(%tag, %image, image_id = image_id.as_deref().unwrap_or("-"), bytes, "exported image");
        Ok(ExportOutcome {
            tag,
            image,
            image_id,
            path: output.map(Path::to_path_buf),
            bytes,
        })
    }

    async fn build_target(
        &self,
        manifest: &Manifest,
        lock: Option<&Lock>,
        target: Option<&str>,
        tag: String,
        deadline: &Deadline,
    ) -> Result<BuildOutcome, CoreError> {
        let dockerfile = self.dockerfile(manifest, lock)?;
        info!(
            image = %manifest.image,
            %tag,
            target = target.unwrap_or("final"),
            engine = self.engine.name(),
            "building image"
        );

        let request = BuildRequest {
            dockerfile,
            tag: tag.clone(),
            target: target.map(str::to_owned),
        };
        let mut stderr = std::io::stderr();
        let echo: Option<&mut (dyn Write + Send)> = if self.options.echo_progress {
            Some(&mut stderr)
        } else {
            None
        };
        let BuildSummary { image_id, lines } = deadline
            .run(Phase::Build, drain(self.engine.build(request), &tag, echo))
            .await?;

        info!(%tag, image_id = image_id.as_deref().unwrap_or("-"), "completed build");
        Ok(BuildOutcome {
            tag,
            image_id,
            output_lines: lines,
        })
    }

    /// Create a container and hand it to a guard. Never retried.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerGuard, EngineError> {
        let id = self.engine.create_container(spec).await?;
        debug!(container_id = %id, image = %spec.image, "created container");
        Ok(ContainerGuard::new(
            Arc::clone(&self.engine),
            id,
            Arc::clone(&self.pending),
        ))
    }

    async fn read_artifacts(
        &self,
        container_id: &str,
        deadline: &Deadline,
    ) -> Result<(Vec<u8>, Vec<u8>), CoreError> {
        let installed = deadline
            .run(Phase::ExtractLock, self.read_file(container_id, INSTALLED_LIST_PATH))
            .await?;
        let hashes = deadline
            .run(Phase::ExtractLock, self.read_file(container_id, DEB_HASHES_PATH))
            .await?;
        Ok((installed, hashes))
    }

    async fn read_file(&self, container_id: &str, path: &str) -> Result<Vec<u8>, CoreError> {
        read_artifact(self.engine.as_ref(), container_id, path)
            .await
            .map_err(|source| CoreError::CopyFile {
                path: path.to_owned(),
                source,
            })
    }

    /// Attach, start, and collect the container's stdout.
    ///
    /// The output only counts once the container exited cleanly.
    async fn stream_rootfs(&self, container_id: &str) -> Result<Bytes, CoreError> {
        let engine_err = |context: &str| {
            let context = format!("{context} container {container_id}");
            move |source: EngineError| CoreError::Export { context, source }
        };

        let mut stdout = self
            .engine
            .attach_stdout(container_id)
            .await
            .map_err(engine_err("attaching to"))?;
        self.engine
            .start_container(container_id)
            .await
            .map_err(engine_err("starting"))?;
        debug!(container_id, "started export container");

        let mut rootfs = Vec::new();
        while let Some(chunk) = stdout.next().await {
            let chunk = chunk.map_err(engine_err("reading output of"))?;
            rootfs.extend_from_slice(&chunk);
        }

        let code = self
            .engine
            .wait_container(container_id)
            .await
            .map_err(engine_err("waiting for"))?;
        if code != 0 {
            return Err(CoreError::ExportExit { code });
        }
        Ok(Bytes::from(rootfs))
    }
}

/// Write through a temp file in the same directory so `output` never holds
/// a partial tarball.
fn write_tarball(output: &Path, rootfs: &[u8]) -> Result<(), CoreError> {
    let write_err = |source: std::io::Error| CoreError::ExportWrite {
        path: output.to_path_buf(),
        source,
    };
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(rootfs).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(output).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// One deadline shared by every step of an operation.
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    async fn run<T, F>(&self, phase: Phase, step: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        match tokio::time::timeout_at(self.at, step).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%phase, after_secs = self.budget.as_secs(), "deadline exceeded");
                Err(CoreError::Timeout {
                    phase,
                    after: self.budget,
                })
            }
        }
    }
}

/// Removal tasks spawned by dropped guards.
#[derive(Default)]
struct PendingCleanup(Mutex<Vec<JoinHandle<()>>>);

impl PendingCleanup {
    fn push(&self, handle: JoinHandle<()>) {
        let mut handles = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn take(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Removes its container when released or dropped.
///
/// Removal failures are logged and never surface as the operation's result.
struct ContainerGuard {
    engine: Arc<dyn BuildEngine>,
    id: Option<String>,
    pending: Arc<PendingCleanup>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn BuildEngine>, id: String, pending: Arc<PendingCleanup>) -> Self {
        Self {
            engine,
            id: Some(id),
            pending,
        }
    }

    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            remove_container(self.engine.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(&self.engine);
                let task = handle.spawn(async move {
                    remove_container(engine.as_ref(), &id).await;
                });
                self.pending.push(task);
            }
            Err(_) => warn!(container_id = %id, "no runtime left to remove container"),
        }
    }
}

async fn remove_container(engine: &dyn BuildEngine, id: &str) {
    match tokio::time::timeout(CLEANUP_GRACE, engine.remove_container(id)).await {
        Ok(Ok(())) => debug!(container_id = id, "removed container"),
        Ok(Err(e)) => warn!(container_id = id, "failed to remove container: {e}"),
        Err(_) => warn!(container_id = id, "timed out removing container"),
    }
}
