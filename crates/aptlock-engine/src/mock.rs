use crate::archive::single_file_archive;
use crate::engine::{
    BuildEngine, BuildRequest, ContainerSpec, ImageDetails, OutputStream, ProgressEvent,
    ProgressStream,
};
use crate::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A recorded call against the mock engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build {
        tag: String,
        target: Option<String>,
        dockerfile: String,
    },
    Inspect(String),
    Create(String),
    Start(String),
    Attach(String),
    Wait(String),
    Copy { id: String, path: String },
    Remove(String),
    Import { reference: String, bytes: usize },
}

/// Phases the mock can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MockFailure {
    /// `build` yields a transport error.
    Transport,
    /// `build` yields an undecodable message after the scripted events.
    Decode,
    /// `build` yields a failed build step after the scripted events.
    Step,
    Inspect,
    Create,
    Start,
    Copy,
    Remove,
    Import,
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    images: BTreeMap<String, ImageDetails>,
    containers: BTreeMap<String, String>,
    imports: BTreeMap<String, Bytes>,
    next_id: u64,
}

/// In-memory [`BuildEngine`].
///
/// A build registers an image under the requested tag, whose parent is the
/// configured base parent, once its progress stream has been drained to the
/// end. Containers created from any image expose the configured files.
pub struct MockEngine {
    state: Mutex<MockState>,
    progress: Vec<ProgressEvent>,
    base_parent: Option<String>,
    files: HashMap<String, Vec<u8>>,
    output: Vec<u8>,
    exit_code: i64,
    build_delay: Option<Duration>,
    copy_delay: Option<Duration>,
    remove_delay: Option<Duration>,
    failures: BTreeSet<MockFailure>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            progress: vec![
                ProgressEvent::output("Step 1/1 : FROM scratch\n"),
                ProgressEvent::output("Successfully built\n"),
            ],
            base_parent: Some(format!("sha256:{:064x}", 0xba5e)),
            files: HashMap::new(),
            output: Vec::new(),
            exit_code: 0,
            build_delay: None,
            copy_delay: None,
            remove_delay: None,
            failures: BTreeSet::new(),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_progress(mut self, events: Vec<ProgressEvent>) -> Self {
        self.progress = events;
        self
    }

    #[must_use]
    pub fn with_base_parent(mut self, parent: Option<&str>) -> Self {
        self.base_parent = parent.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_owned(), content.into());
        self
    }

    /// Bytes written to stdout by any started container.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<Vec<u8>>, exit_code: i64) -> Self {
        self.output = output.into();
        self.exit_code = exit_code;
        self
    }

    /// Delay every build progress event, to exercise deadlines.
    #[must_use]
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Delay every file copy, to hold a container open.
    #[must_use]
    pub fn with_copy_delay(mut self, delay: Duration) -> Self {
        self.copy_delay = Some(delay);
        self
    }

    /// Delay every container removal, so cleanup spans a yield point.
    #[must_use]
    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn failing(mut self, failure: MockFailure) -> Self {
        self.failures.insert(failure);
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock_state().calls.clone()
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        self.lock_state().containers.keys().cloned().collect()
    }

    pub fn image(&self, tag: &str) -> Option<ImageDetails> {
        self.lock_state().images.get(tag).cloned()
    }

    /// The tarball last imported as `reference`.
    pub fn imported(&self, reference: &str) -> Option<Bytes> {
        self.lock_state().imports.get(reference).cloned()
    }

    fn register_image(&self, tag: String, parent: Option<String>) -> String {
        let mut state = self.lock_state();
        state.next_id += 1;
        let id = format!("sha256:{:064x}", state.next_id);
        state.images.insert(
            tag,
            ImageDetails {
                id: id.clone(),
                parent,
            },
        );
        id
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned mutex only means another test thread panicked mid-call.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fails(&self, failure: MockFailure) -> bool {
        self.failures.contains(&failure)
    }

    fn record(&self, call: EngineCall) {
        self.lock_state().calls.push(call);
    }

    fn container_exists(&self, id: &str) -> Result<(), EngineError> {
        if self.lock_state().containers.contains_key(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("no such container: {id}")))
        }
    }
}

#[async_trait]
impl BuildEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn build(&self, request: BuildRequest) -> ProgressStream<'_> {
        self.record(EngineCall::Build {
            tag: request.tag.clone(),
            target: request.target.clone(),
            dockerfile: request.dockerfile.clone(),
        });

        if self.fails(MockFailure::Transport) {
            return stream::once(async {
                Err(EngineError::Transport("connection refused".to_owned()))
            })
            .boxed();
        }

        let mut items: Vec<Result<ProgressEvent, EngineError>> =
            self.progress.iter().cloned().map(Ok).collect();
        let succeeds = if self.fails(MockFailure::Decode) {
            items.push(Err(EngineError::Decode("expected value at line 1".to_owned())));
            false
        } else if self.fails(MockFailure::Step) {
            items.push(Ok(ProgressEvent::failure(
                "The command '/bin/sh -c apt-get update' returned a non-zero code: 100",
            )));
            false
        } else {
            true
        };

        // The image only exists once the caller has read the final event.
        let tag = request.tag;
        let finish = stream::once(async move {
            succeeds.then(|| {
                let id = self.register_image(tag, self.base_parent.clone());
                Ok(ProgressEvent {
                    image_id: Some(id),
                    ..ProgressEvent::default()
                })
            })
        })
        .filter_map(future::ready);

        let delay = self.build_delay;
        stream::iter(items)
            .chain(finish)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, EngineError> {
        self.record(EngineCall::Inspect(reference.to_owned()));
        if self.fails(MockFailure::Inspect) {
            return Err(EngineError::Transport("inspect timed out".to_owned()));
        }
        self.image(reference)
            .ok_or_else(|| EngineError::NotFound(format!("no such image: {reference}")))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(EngineCall::Create(spec.image.clone()));
        if self.fails(MockFailure::Create) {
            return Err(EngineError::Api {
                status: 500,
                message: "create failed".to_owned(),
            });
        }
        let mut state = self.lock_state();
        if !state.images.contains_key(&spec.image) {
            return Err(EngineError::NotFound(format!("no such image: {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("ctr{:08}", state.next_id);
        state.containers.insert(id.clone(), spec.image.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Start(id.to_owned()));
        self.container_exists(id)?;
        if self.fails(MockFailure::Start) {
            return Err(EngineError::Api {
                status: 500,
                message: "start failed".to_owned(),
            });
        }
        Ok(())
    }

    async fn attach_stdout(&self, id: &str) -> Result<OutputStream, EngineError> {
        self.record(EngineCall::Attach(id.to_owned()));
        self.container_exists(id)?;
        let chunks: Vec<Result<Bytes, EngineError>> = self
            .output
            .chunks(4096)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        self.record(EngineCall::Wait(id.to_owned()));
        self.container_exists(id)?;
        Ok(self.exit_code)
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        self.record(EngineCall::Copy {
            id: id.to_owned(),
            path: path.to_owned(),
        });
        self.container_exists(id)?;
        if let Some(delay) = self.copy_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fails(MockFailure::Copy) {
            return Err(EngineError::Transport("copy interrupted".to_owned()));
        }
        let content = self
            .files
            .get(path)
            .ok_or_else(|| EngineError::NotFound(format!("no such file: {path}")))?;
        let name = path.rsplit('/').next().unwrap_or(path);
        single_file_archive(name, content, 0o644)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(id.to_owned()));
        if let Some(delay) = self.remove_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fails(MockFailure::Remove) {
            return Err(EngineError::Api {
                status: 409,
                message: "removal already in progress".to_owned(),
            });
        }
        match self.lock_state().containers.remove(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn import_image(
        &self,
        reference: &str,
        rootfs: Bytes,
    ) -> Result<Option<String>, EngineError> {
        self.record(EngineCall::Import {
            reference: reference.to_owned(),
            bytes: rootfs.len(),
        });
        if self.fails(MockFailure::Import) {
            return Err(EngineError::Rejected("invalid tar header".to_owned()));
        }
        self.lock_state().imports.insert(reference.to_owned(), rootfs);
        Ok(Some(self.register_image(reference.to_owned(), None)))
    }
}
