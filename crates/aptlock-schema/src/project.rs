use crate::lock::{Lock, LockError};
use crate::manifest::{parse_manifest_str, Manifest, ManifestError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
    #[error("parsing {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: LockError,
    },
}

/// A manifest together with its lock, if one has been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub manifest: Manifest,
    pub lock: Option<Lock>,
    pub manifest_path: PathBuf,
    pub lock_path: PathBuf,
}

impl Project {
    pub fn locked_package_count(&self) -> usize {
        self.lock.as_ref().map_or(0, Lock::package_count)
    }
}

/// Load `<dir>/<manifest_name>` and, if it exists, `<dir>/<lock_name>`.
///
/// A missing lock file is not an error: it means no lock has been produced yet.
pub fn load_project(dir: &Path, manifest_name: &str, lock_name: &str) -> Result<Project, ProjectError> {
    let manifest_path = dir.join(manifest_name);
    let content = std::fs::read_to_string(&manifest_path).map_err(|source| ProjectError::Read {
        path: manifest_path.clone(),
        source,
    })?;
    let manifest = parse_manifest_str(&content).map_err(|source| ProjectError::Manifest {
        path: manifest_path.clone(),
        source,
    })?;

    let lock_path = dir.join(lock_name);
    let lock = match std::fs::read_to_string(&lock_path) {
        Ok(content) => {
            let lock = Lock::from_json(&content)
                .and_then(|lock| lock.validate().map(|()| lock))
                .map_err(|source| ProjectError::Lock {
                    path: lock_path.clone(),
                    source,
                })?;
            Some(lock)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(source) => {
            return Err(ProjectError::Read {
                path: lock_path,
                source,
            })
        }
    };

    Ok(Project {
        manifest,
        lock,
        manifest_path,
        lock_path,
    })
}
