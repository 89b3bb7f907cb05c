//! Lock extraction from the manifest stage's text artifacts.
//!
//! The parsing and join functions are pure; [`read_artifact`] is the only
//! piece that talks to an engine.

use aptlock_engine::{single_entry, BuildEngine, EngineError};
use aptlock_schema::{Lock, LockedPackage, PackageName};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// `<package>/<release> <version> <arch> <meta>`, as printed by
/// `apt list --installed -qq`.
static INSTALLED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<package>[^/ ]+)/(?P<release>[^ ]+) (?P<version>[^ ]+) (?P<arch>[^ ]+) (?P<meta>[^ ]+)",
    )
    .expect("installed-package pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: PackageName,
    pub release: String,
    pub version: String,
    pub architecture: String,
    pub meta: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageHash {
    pub package: PackageName,
    pub filename: String,
    pub hash: String,
}

/// Result of assembling a lock, with the problems that were tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub lock: Lock,
    /// Lines of either artifact that did not have the expected shape.
    pub skipped_lines: Vec<String>,
    /// Installed packages with no matching hash line.
    pub missing_hashes: Vec<PackageName>,
}

pub fn parse_installed_line(line: &str) -> Option<InstalledPackage> {
    let caps = INSTALLED_LINE.captures(line)?;
    Some(InstalledPackage {
        name: PackageName::from(&caps["package"]),
        release: caps["release"].to_owned(),
        version: caps["version"].to_owned(),
        architecture: caps["arch"].to_owned(),
        meta: caps["meta"].to_owned(),
    })
}

/// Parse `<hash>  <filename>`. The package name is the filename up to its first `_`.
pub fn parse_hash_line(line: &str) -> Option<PackageHash> {
    let (hash, filename) = line.split_once("  ")?;
    let filename = filename.trim();
    if hash.is_empty() || filename.is_empty() || hash.contains(' ') {
        return None;
    }
    Some(PackageHash {
        package: PackageName::from_archive_filename(filename)?,
        filename: filename.to_owned(),
        hash: hash.to_owned(),
    })
}

/// Join the installed listing with the hash listing into a lock pinned to `image`.
///
/// Unparsable lines and packages without a hash are logged and skipped;
/// neither fails the extraction. A package listed twice keeps its last line.
pub fn assemble_lock(image: &str, installed: &str, hashes: &str) -> Extraction {
    let mut skipped_lines = Vec::new();

    let mut by_package: HashMap<PackageName, PackageHash> = HashMap::new();
    for line in hashes.lines().filter(|l| !l.trim().is_empty()) {
        match parse_hash_line(line) {
            Some(entry) => {
                by_package.insert(entry.package.clone(), entry);
            }
            None => {
                warn!(line, "unmatched hash line");
                skipped_lines.push(line.to_owned());
            }
        }
    }

    let mut lock = Lock::new(image);
    for line in installed.lines().filter(|l| !l.trim().is_empty()) {
        let Some(pkg) = parse_installed_line(line) else {
            warn!(line, "unmatched package line");
            skipped_lines.push(line.to_owned());
            continue;
        };
        let mut locked = LockedPackage {
            version: pkg.version,
            architecture: pkg.architecture,
            ..LockedPackage::default()
        };
        if let Some(entry) = by_package.get(&pkg.name) {
            locked.filename.clone_from(&entry.filename);
            locked.filehash.clone_from(&entry.hash);
        }
        lock.packages.insert(pkg.name, locked);
    }

    let missing_hashes: Vec<PackageName> = lock
        .packages
        .iter()
        .filter(|(_, pkg)| pkg.filehash.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    for package in &missing_hashes {
        warn!(%package, "no archive hash for installed package");
    }

    debug!(
        image,
        packages = lock.package_count(),
        skipped = skipped_lines.len(),
        "assembled lock"
    );
    Extraction {
        lock,
        skipped_lines,
        missing_hashes,
    }
}

/// Copy one file out of a created container and return its raw bytes.
pub async fn read_artifact(
    engine: &dyn BuildEngine,
    container_id: &str,
    path: &str,
) -> Result<Vec<u8>, EngineError> {
    let archive = engine.copy_from_container(container_id, path).await?;
    single_entry(&archive)
}
