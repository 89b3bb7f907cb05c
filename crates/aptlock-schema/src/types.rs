//! Package identifiers.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// Debian package name. Case-sensitive, unique within a manifest or lock.
///
/// Serializes as a plain string so it can key the `packages` objects of both
/// file formats, and borrows as `str` so those maps can be queried by `&str`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The package an archive belongs to: `bash_5.1-2_amd64.deb` is `bash`.
    ///
    /// Returns `None` when nothing precedes the first `_`.
    pub fn from_archive_filename(filename: &str) -> Option<Self> {
        let name = filename.split('_').next()?;
        if name.is_empty() {
            None
        } else {
            Some(Self::new(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for PackageName {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
