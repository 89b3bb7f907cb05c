use crate::is_package_token;
use crate::types::PackageName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default manifest file name inside a project directory.
pub const MANIFEST_FILENAME: &str = "dpkg.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("image must not be empty")]
    EmptyImage,
    #[error("invalid image name '{0}': expected lowercase [a-z0-9._/-] without leading or trailing separators")]
    InvalidImage(String),
    #[error("distro must not be empty")]
    EmptyDistro,
    #[error("invalid distro codename '{0}': expected lowercase letters and digits")]
    InvalidDistro(String),
    #[error("invalid package name '{0}'")]
    InvalidPackageName(String),
    #[error("invalid version '{version}' for package '{package}'")]
    InvalidVersion { package: String, version: String },
}

/// Release channel symbols accepted in place of an exact version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Stable,
    Unstable,
    Testing,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Stable, Channel::Unstable, Channel::Testing];

    /// Look up a channel by its exact symbol. No version parsing is attempted.
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "stable" => Some(Channel::Stable),
            "unstable" => Some(Channel::Unstable),
            "testing" => Some(Channel::Testing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Unstable => "unstable",
            Channel::Testing => "testing",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either a release channel or an exact package version.
///
/// Serialized as the plain string found in `dpkg.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PackageVersionSpec {
    Channel(Channel),
    Exact(String),
}

impl PackageVersionSpec {
    /// Render the apt install argument for `name`: `name/channel` or `name=version`.
    pub fn install_arg(&self, name: &str) -> String {
        match self {
            PackageVersionSpec::Channel(channel) => format!("{name}/{channel}"),
            PackageVersionSpec::Exact(version) => format!("{name}={version}"),
        }
    }
}

impl From<String> for PackageVersionSpec {
    fn from(s: String) -> Self {
        match Channel::from_symbol(&s) {
            Some(channel) => PackageVersionSpec::Channel(channel),
            None => PackageVersionSpec::Exact(s),
        }
    }
}

impl From<&str> for PackageVersionSpec {
    fn from(s: &str) -> Self {
        PackageVersionSpec::from(s.to_owned())
    }
}

impl From<PackageVersionSpec> for String {
    fn from(spec: PackageVersionSpec) -> Self {
        match spec {
            PackageVersionSpec::Channel(channel) => channel.as_str().to_owned(),
            PackageVersionSpec::Exact(version) => version,
        }
    }
}

impl fmt::Display for PackageVersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageVersionSpec::Channel(channel) => channel.fmt(f),
            PackageVersionSpec::Exact(version) => f.write_str(version),
        }
    }
}

/// Desired state of an image: base distribution plus requested packages.
///
/// `packages` is a `BTreeMap`, so iteration is always in key order regardless
/// of the order entries appeared in the file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub image: String,
    pub distro: String,
    #[serde(default, deserialize_with = "crate::unique_packages")]
    pub packages: BTreeMap<PackageName, PackageVersionSpec>,
}

impl Manifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.image.is_empty() {
            return Err(ManifestError::EmptyImage);
        }
        if !is_image_name(&self.image) {
            return Err(ManifestError::InvalidImage(self.image.clone()));
        }
        if self.distro.is_empty() {
            return Err(ManifestError::EmptyDistro);
        }
        if !self
            .distro
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(ManifestError::InvalidDistro(self.distro.clone()));
        }
        for (name, spec) in &self.packages {
            if !is_package_token(name) {
                return Err(ManifestError::InvalidPackageName(name.to_string()));
            }
            if let PackageVersionSpec::Exact(version) = spec {
                if !is_package_token(version) {
                    return Err(ManifestError::InvalidVersion {
                        package: name.to_string(),
                        version: version.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }
}

fn is_image_name(s: &str) -> bool {
    let valid_chars = s.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '/' | '-')
    });
    let bad_edge = |c: char| matches!(c, '.' | '_' | '/' | '-');
    valid_chars
        && !s.starts_with(bad_edge)
        && !s.ends_with(bad_edge)
        && !s.contains("//")
}

/// Parse and validate a manifest from its JSON text.
pub fn parse_manifest_str(input: &str) -> Result<Manifest, ManifestError> {
    let manifest: Manifest = serde_json::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}
