//! Manifest and lock file model for aptlock.
//!
//! This crate defines the schema layer: the desired-state `Manifest` (`dpkg.json`),
//! the resolved-state `Lock` (`dpkg-lock.json`), package version specs with their
//! release-channel symbols, lock diffing, and loading a manifest/lock pair from a
//! project directory. There is no engine or build logic here.

pub mod lock;
pub mod manifest;
pub mod project;
pub mod types;

pub use lock::{Lock, LockDiff, LockError, LockedPackage, VersionChange, LOCK_FILENAME};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, Channel, Manifest, ManifestError,
    PackageVersionSpec, MANIFEST_FILENAME,
};
pub use project::{load_project, Project, ProjectError};
pub use types::PackageName;

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt;
use std::marker::PhantomData;

/// Characters permitted in package names, versions and architectures.
///
/// These values are interpolated into shell commands inside build stages.
pub(crate) fn is_package_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | ':' | '_' | '-'))
}

/// Deserialize a `packages` object, rejecting a package name that appears twice.
///
/// A plain `BTreeMap` would keep the last occurrence without complaint.
pub(crate) fn unique_packages<'de, D, V>(deserializer: D) -> Result<BTreeMap<PackageName, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct PackagesVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for PackagesVisitor<V> {
        type Value = BTreeMap<PackageName, V>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an object keyed by package name")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut packages = BTreeMap::new();
            while let Some((name, value)) = map.next_entry::<PackageName, V>()? {
                match packages.entry(name) {
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                    Entry::Occupied(slot) => {
                        return Err(de::Error::custom(format_args!(
                            "duplicate package '{}'",
                            slot.key()
                        )));
                    }
                }
            }
            Ok(packages)
        }
    }

    deserializer.deserialize_map(PackagesVisitor(PhantomData))
}
