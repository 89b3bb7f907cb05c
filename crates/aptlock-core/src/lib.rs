//! Manifest-to-build-to-lock pipeline for aptlock.
//!
//! `buildspec` compiles a manifest (and optional lock) into a deterministic
//! multi-stage build specification, `builder` drives a [`BuildEngine`] through
//! it, and `extract` turns the introspection stage's text output into a
//! [`Lock`]. Every failure is a [`CoreError`] that names the pipeline phase.
//!
//! [`BuildEngine`]: aptlock_engine::BuildEngine
//! [`Lock`]: aptlock_schema::Lock

pub mod builder;
pub mod buildspec;
pub mod config;
pub mod extract;
pub mod progress;

pub use builder::{build_tag, manifest_tag, BuildOutcome, Builder, BuilderOptions, ExportOutcome};
pub use buildspec::{
    generate, BuildSpec, Directive, GenerateError, GenerateOptions, Stage, StageBase,
};
pub use config::{BuilderConfig, ConfigError};
pub use extract::{assemble_lock, parse_hash_line, parse_installed_line, Extraction};
pub use progress::{drain, BuildSummary};

use aptlock_engine::EngineError;
use aptlock_schema::{LockError, ProjectError};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline phase a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Load,
    Generate,
    Build,
    Inspect,
    ExtractLock,
    WriteLock,
    Export,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Load => "load",
            Phase::Generate => "generate",
            Phase::Build => "build",
            Phase::Inspect => "inspect",
            Phase::ExtractLock => "extract-lock",
            Phase::WriteLock => "write-lock",
            Phase::Export => "export",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("load: {0}")]
    Project(#[from] ProjectError),
    #[error("load: {0}")]
    Config(#[from] ConfigError),
    #[error("generate: {0}")]
    Generate(#[from] GenerateError),
    #[error("build: {tag}: {source}")]
    Build {
        tag: String,
        #[source]
        source: EngineError,
    },
    #[error("build: {tag}: undecodable progress stream: {message}")]
    ProgressDecode { tag: String, message: String },
    #[error("build: {tag}: build step failed: {message}")]
    BuildStep { tag: String, message: String },
    #[error("inspect: {image}: {source}")]
    Inspect {
        image: String,
        #[source]
        source: EngineError,
    },
    #[error("inspect: {image} has no parent image to pin")]
    MissingParent { image: String },
    #[error("extract-lock: creating container from {image}: {source}")]
    CreateContainer {
        image: String,
        #[source]
        source: EngineError,
    },
    #[error("extract-lock: reading {path}: {source}")]
    CopyFile {
        path: String,
        #[source]
        source: EngineError,
    },
    #[error("write-lock: {}: {source}", path.display())]
    WriteLock {
        path: PathBuf,
        #[source]
        source: LockError,
    },
    #[error("export: {context}: {source}")]
    Export {
        context: String,
        #[source]
        source: EngineError,
    },
    #[error("export: container exited with status {code}")]
    ExportExit { code: i64 },
    #[error("export: writing {}: {source}", path.display())]
    ExportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{phase}: deadline of {}s exceeded", after.as_secs())]
    Timeout { phase: Phase, after: Duration },
}

impl CoreError {
    pub fn phase(&self) -> Phase {
        match self {
            CoreError::Project(_) | CoreError::Config(_) => Phase::Load,
            CoreError::Generate(_) => Phase::Generate,
            CoreError::Build { .. }
            | CoreError::ProgressDecode { .. }
            | CoreError::BuildStep { .. } => Phase::Build,
            CoreError::Inspect { .. } | CoreError::MissingParent { .. } => Phase::Inspect,
            CoreError::CreateContainer { .. } | CoreError::CopyFile { .. } => Phase::ExtractLock,
            CoreError::WriteLock { .. } => Phase::WriteLock,
            CoreError::Export { .. } | CoreError::ExportExit { .. } | CoreError::ExportWrite { .. } => {
                Phase::Export
            }
            CoreError::Timeout { phase, .. } => *phase,
        }
    }

    /// True for failures caused by the user's manifest, lock or config files.
    pub fn is_input_error(&self) -> bool {
        matches!(self, CoreError::Project(_) | CoreError::Config(_))
    }

    /// True for failures reported by, or in reaching, the build engine.
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self.phase(),
            Phase::Build | Phase::Inspect | Phase::ExtractLock | Phase::Export
        ) && !matches!(self, CoreError::Timeout { .. } | CoreError::ExportWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_phase() {
        let err = CoreError::BuildStep {
            tag: "aptlock-manifest/example".to_owned(),
            message: "exit code 100".to_owned(),
        };
        assert!(err.to_string().starts_with("build: "));
        assert_eq!(err.phase(), Phase::Build);

        let err = CoreError::MissingParent {
            image: "aptlock-manifest/example".to_owned(),
        };
        assert!(err.to_string().starts_with("inspect: "));

        let err = CoreError::CopyFile {
            path: "/apt-installed.txt".to_owned(),
            source: EngineError::NotFound("no such file".to_owned()),
        };
        assert!(err.to_string().starts_with("extract-lock: "));
    }

    #[test]
    fn timeout_carries_phase() {
        let err = CoreError::Timeout {
            phase: Phase::ExtractLock,
            after: Duration::from_secs(5),
        };
        assert_eq!(err.phase(), Phase::ExtractLock);
        assert_eq!(err.to_string(), "extract-lock: deadline of 5s exceeded");
        assert!(!err.is_engine_error());
    }

    #[test]
    fn classification() {
        let err = CoreError::Build {
            tag: "t".to_owned(),
            source: EngineError::Transport("refused".to_owned()),
        };
        assert!(err.is_engine_error());
        assert!(!err.is_input_error());
    }
}
