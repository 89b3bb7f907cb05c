use crate::is_package_token;
use crate::manifest::Manifest;
use crate::types::PackageName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default lock file name inside a project directory.
pub const LOCK_FILENAME: &str = "dpkg-lock.json";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("lock file has no pinned base image")]
    EmptyImage,
    #[error("lock base image '{0}' is not a '<name>@sha256:<hex>' reference")]
    InvalidImage(String),
    #[error("invalid locked package '{package}': bad {field} '{value}'")]
    InvalidField {
        package: String,
        field: &'static str,
        value: String,
    },
}

/// A resolved package as installed by the package manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedPackage {
    pub version: String,
    pub architecture: String,
    /// Archive file name, e.g. `bash_5.1-2_amd64.deb`. Empty when no hash line matched.
    #[serde(default)]
    pub filename: String,
    /// sha512 of the archive file. Empty when no hash line matched.
    #[serde(default)]
    pub filehash: String,
}

impl LockedPackage {
    pub fn has_hash(&self) -> bool {
        !self.filename.is_empty() && !self.filehash.is_empty()
    }
}

/// The lock file captures the resolved state of an image.
///
/// `image` is a content-addressed base image reference (`debian@sha256:...`),
/// never a floating tag. The package set is a superset of the manifest's
/// explicit packages, since it also records what was pulled in transitively.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    pub image: String,
    #[serde(default, deserialize_with = "crate::unique_packages")]
    pub packages: BTreeMap<PackageName, LockedPackage>,
}

impl Lock {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            packages: BTreeMap::new(),
        }
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Locked packages that carry both a filename and a hash, in name order.
    pub fn hashed_packages(&self) -> impl Iterator<Item = (&PackageName, &LockedPackage)> {
        self.packages.iter().filter(|(_, pkg)| pkg.has_hash())
    }

    /// Explicit manifest packages that this lock does not cover.
    ///
    /// The lock is allowed to contain more packages than the manifest; only the
    /// other direction is reported.
    pub fn missing_from(&self, manifest: &Manifest) -> Vec<PackageName> {
        manifest
            .packages
            .keys()
            .filter(|name| !self.packages.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Check that every field rendered into build commands is shell-safe.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.image.trim().is_empty() {
            return Err(LockError::EmptyImage);
        }
        if !is_pinned_reference(&self.image) {
            return Err(LockError::InvalidImage(self.image.clone()));
        }
        for (name, pkg) in &self.packages {
            let invalid = |field: &'static str, value: &str| LockError::InvalidField {
                package: name.to_string(),
                field,
                value: value.to_owned(),
            };
            if !is_package_token(name) {
                return Err(invalid("name", name));
            }
            if !is_package_token(&pkg.version) {
                return Err(invalid("version", &pkg.version));
            }
            if !pkg.architecture.is_empty() && !is_package_token(&pkg.architecture) {
                return Err(invalid("architecture", &pkg.architecture));
            }
            if !pkg.filename.is_empty() && !is_archive_filename(&pkg.filename) {
                return Err(invalid("filename", &pkg.filename));
            }
            if !pkg.filehash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("filehash", &pkg.filehash));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, LockError> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        Ok(content)
    }

    pub fn from_json(input: &str) -> Result<Self, LockError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Write the lock atomically: a temp file in the same directory is
    /// synced and renamed over `path`, so a failure leaves the old lock intact.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LockError> {
        let path = path.as_ref();
        let content = self.to_json()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LockError::Io(e.error))?;
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// `<name>@sha256:<hex>`, where the name may carry a registry host and port.
fn is_pinned_reference(s: &str) -> bool {
    let Some((name, digest)) = s.split_once('@') else {
        return false;
    };
    let Some(hex) = digest.strip_prefix("sha256:") else {
        return false;
    };
    let separator = |c: char| matches!(c, '.' | '_' | '/' | ':' | '-');
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || separator(c))
        && !name.starts_with(separator)
        && !name.ends_with(separator)
        && !hex.is_empty()
        && hex.chars().all(|c| c.is_ascii_digit() || matches!(c, 'a'..='f'))
}

fn is_archive_filename(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | ':' | '%' | '_' | '-'))
}

/// A package whose locked version moved between two locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionChange {
    pub name: PackageName,
    pub from: String,
    pub to: String,
}

/// Differences between a previous lock and a freshly resolved one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockDiff {
    pub image_changed: Option<(String, String)>,
    pub added: Vec<(PackageName, String)>,
    pub removed: Vec<(PackageName, String)>,
    pub changed: Vec<VersionChange>,
}

impl LockDiff {
    pub fn between(old: &Lock, new: &Lock) -> Self {
        let mut diff = LockDiff::default();
        if old.image != new.image {
            diff.image_changed = Some((old.image.clone(), new.image.clone()));
        }
        for (name, pkg) in &new.packages {
            match old.packages.get(name) {
                None => diff.added.push((name.clone(), pkg.version.clone())),
                Some(prev) if prev.version != pkg.version => diff.changed.push(VersionChange {
                    name: name.clone(),
                    from: prev.version.clone(),
                    to: pkg.version.clone(),
                }),
                Some(_) => {}
            }
        }
        for (name, pkg) in &old.packages {
            if !new.packages.contains_key(name) {
                diff.removed.push((name.clone(), pkg.version.clone()));
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.image_changed.is_none()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest_str;

    fn sample_lock() -> Lock {
        let mut lock = Lock::new("debian@sha256:deadbeef");
        lock.packages.insert(
            PackageName::from("bash"),
            LockedPackage {
                version: "5.1-2".to_owned(),
                architecture: "amd64".to_owned(),
                filename: "bash_5.1-2_amd64.deb".to_owned(),
                filehash: "aaaa".to_owned(),
            },
        );
        lock.packages.insert(
            PackageName::from("coreutils"),
            LockedPackage {
                version: "8.32-4".to_owned(),
                architecture: "amd64".to_owned(),
                filename: String::new(),
                filehash: String::new(),
            },
        );
        lock
    }

    #[test]
    fn lock_roundtrip_through_file() {
        let lock = sample_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILENAME);

        lock.write_to_file(&path).unwrap();
        let loaded = Lock::read_from_file(&path).unwrap();
        assert_eq!(lock, loaded);
    }

    #[test]
    fn lock_json_shape() {
        let json = sample_lock().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["image"], "debian@sha256:deadbeef");
        assert_eq!(value["packages"]["bash"]["version"], "5.1-2");
        assert_eq!(value["packages"]["bash"]["architecture"], "amd64");
        assert_eq!(value["packages"]["bash"]["filename"], "bash_5.1-2_amd64.deb");
        assert_eq!(value["packages"]["bash"]["filehash"], "aaaa");
        assert_eq!(value["packages"]["coreutils"]["filehash"], "");
        assert!(json.ends_with('\n'));
    }

    #[test]
    fn lock_without_hash_fields_loads() {
        let input = r#"{"image": "debian@sha256:ab", "packages": {"bash": {"version": "5.0-4", "architecture": "amd64"}}}"#;
        let lock = Lock::from_json(input).unwrap();
        let bash = &lock.packages["bash"];
        assert!(bash.filename.is_empty());
        assert!(!bash.has_hash());
    }

    #[test]
    fn duplicate_locked_package_is_rejected() {
        let input = r#"{"image": "debian@sha256:ab", "packages": {
            "bash": {"version": "5.0-4", "architecture": "amd64"},
            "bash": {"version": "5.1-2", "architecture": "amd64"}}}"#;
        let err = Lock::from_json(input).unwrap_err();
        assert!(matches!(err, LockError::Parse(_)));
        assert!(err.to_string().contains("duplicate package 'bash'"), "{err}");
    }

    #[test]
    fn write_replaces_existing_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILENAME);
        fs::write(&path, "{ \"image\": \"old\", \"packages\": {}, \"padding\": \"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\" }").unwrap();

        let lock = Lock::new("debian@sha256:01");
        lock.write_to_file(&path).unwrap();
        let loaded = Lock::read_from_file(&path).unwrap();
        assert_eq!(loaded, lock);
    }

    #[test]
    fn hashed_packages_skips_partial_records() {
        let lock = sample_lock();
        let hashed: Vec<&str> = lock.hashed_packages().map(|(n, _)| n.as_str()).collect();
        assert_eq!(hashed, vec!["bash"]);
    }

    #[test]
    fn superset_lock_is_not_missing_anything() {
        let manifest =
            parse_manifest_str(r#"{"image": "a", "distro": "buster", "packages": {"bash": "stable"}}"#)
                .unwrap();
        assert!(sample_lock().missing_from(&manifest).is_empty());
    }

    #[test]
    fn missing_explicit_package_reported() {
        let manifest = parse_manifest_str(
            r#"{"image": "a", "distro": "buster", "packages": {"bash": "stable", "vim": "stable"}}"#,
        )
        .unwrap();
        assert_eq!(sample_lock().missing_from(&manifest), vec![PackageName::from("vim")]);
    }

    #[test]
    fn validate_accepts_sample() {
        assert!(sample_lock().validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_hex_hash() {
        let mut lock = sample_lock();
        lock.packages.get_mut("bash").unwrap().filehash = "\"; reboot".to_owned();
        assert!(matches!(
            lock.validate(),
            Err(LockError::InvalidField { field: "filehash", .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_image() {
        let lock = Lock::new("");
        assert!(matches!(lock.validate(), Err(LockError::EmptyImage)));
    }

    #[test]
    fn validate_rejects_directive_in_image() {
        let lock =
            Lock::from_json(r#"{"image": "debian@sha256:ab\nRUN touch /pwned", "packages": {}}"#)
                .unwrap();
        assert!(matches!(lock.validate(), Err(LockError::InvalidImage(_))));
    }

    #[test]
    fn validate_requires_digest_reference() {
        for image in [
            "debian:bookworm-slim",
            "debian@sha256:",
            "debian@sha256:XYZ",
            "debian@md5:abcd",
            "@sha256:abcd",
            "debian @sha256:abcd",
            "debian@sha256:ab cd",
        ] {
            assert!(
                matches!(Lock::new(image).validate(), Err(LockError::InvalidImage(_))),
                "{image} must be rejected"
            );
        }
        for image in [
            "debian@sha256:deadbeef",
            "registry.local:5000/library/debian@sha256:0123456789abcdef",
        ] {
            assert!(Lock::new(image).validate().is_ok(), "{image} must be accepted");
        }
    }

    #[test]
    fn diff_reports_changes() {
        let old = sample_lock();
        let mut new = sample_lock();
        new.image = "debian@sha256:cafe".to_owned();
        new.packages.remove("coreutils");
        new.packages.get_mut("bash").unwrap().version = "5.2-1".to_owned();
        new.packages.insert(
            PackageName::from("zlib1g"),
            LockedPackage {
                version: "1:1.2.13".to_owned(),
                architecture: "amd64".to_owned(),
                ..LockedPackage::default()
            },
        );

        let diff = LockDiff::between(&old, &new);
        assert_eq!(
            diff.image_changed,
            Some(("debian@sha256:deadbeef".to_owned(), "debian@sha256:cafe".to_owned()))
        );
        assert_eq!(diff.added, vec![(PackageName::from("zlib1g"), "1:1.2.13".to_owned())]);
        assert_eq!(diff.removed, vec![(PackageName::from("coreutils"), "8.32-4".to_owned())]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].from, "5.1-2");
        assert_eq!(diff.changed[0].to, "5.2-1");
    }

    #[test]
    fn diff_of_identical_locks_is_empty() {
        let lock = sample_lock();
        assert!(LockDiff::between(&lock, &lock.clone()).is_empty());
    }
}
