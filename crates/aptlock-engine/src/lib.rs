//! Build engine boundary for aptlock.
//!
//! This crate defines the capability the build executor depends on: a
//! `BuildEngine` trait covering image builds (as a stream of progress events),
//! image inspection, and the container lifecycle (create, start, attach, wait,
//! copy a file out, remove), plus importing a root filesystem tarball as an
//! image. `DockerEngine` implements it against a
//! Docker-compatible daemon; `MockEngine` is an in-memory stand-in for tests.

pub mod archive;
pub mod docker;
pub mod engine;
pub mod mock;

pub use archive::{build_context, dockerfile_through, single_entry};
pub use docker::DockerEngine;
pub use engine::{
    BuildEngine, BuildRequest, ContainerSpec, ImageDetails, OutputStream, ProgressEvent,
    ProgressStream,
};
pub use mock::{EngineCall, MockEngine, MockFailure};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Transport(String),
    #[error("undecodable engine response: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("engine API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("engine rejected the request: {0}")]
    Rejected(String),
    #[error("malformed archive: {0}")]
    Archive(String),
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}
