//! Deterministic build specification (Dockerfile) generation.
//!
//! A [`Manifest`] and an optional [`Lock`] are first planned into a typed
//! stage graph ([`BuildSpec`]) and then rendered to text. Package maps are
//! `BTreeMap`s, so every list derived from them is already in key order;
//! rendering never depends on insertion order.

use aptlock_schema::{Lock, Manifest};
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Stage the floating or pinned base image is imported as.
pub const BASE_STAGE: &str = "base";
/// Stage that refreshes the package index.
pub const SOURCES_STAGE: &str = "sources";
/// Stage that bootstraps the root filesystem and installs packages.
pub const BUILD_STAGE: &str = "build";
/// Introspection stage; build target for the lock pipeline.
pub const MANIFEST_STAGE: &str = "manifest";

/// Installed-package listing written by the manifest stage.
pub const INSTALLED_LIST_PATH: &str = "/apt-installed.txt";
/// Package archive hashes written by the manifest stage.
pub const DEB_HASHES_PATH: &str = "/deb-hashes.txt";

const ROOTFS_VAR: &str = "ROOTFS_PATH";
const ROOTFS_PATH: &str = "/rootfs";
const ARCHIVES_DIR: &str = "$ROOTFS_PATH/var/cache/apt/archives";

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("rendering build specification: {0}")]
    Render(#[from] fmt::Error),
}

/// Host-specific knobs that shape the generated specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Caching HTTP proxy used while fetching packages. Cleared in the final image.
    pub proxy: Option<String>,
    /// Debian mirror passed to debootstrap.
    pub mirror: String,
    pub architecture: String,
    /// Repository of the floating base image (`<family>:<distro>-slim`).
    pub base_family: String,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            mirror: "http://deb.debian.org/debian".to_owned(),
            architecture: "amd64".to_owned(),
            base_family: "debian".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageBase {
    Image(String),
    Stage(String),
}

impl fmt::Display for StageBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageBase::Image(image) => f.write_str(image),
            StageBase::Stage(stage) => f.write_str(stage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Arg { name: String, value: String },
    Env { name: String, value: String },
    /// Shell command. Embedded newlines must already carry `\` continuations.
    Run(String),
    Cmd(Vec<String>),
}

impl Directive {
    fn env(name: &str, value: impl Into<String>) -> Self {
        Directive::Env {
            name: name.to_owned(),
            value: value.into(),
        }
    }

    fn run(command: impl Into<String>) -> Self {
        Directive::Run(command.into())
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Arg { name, value } => write!(f, "ARG {name}={value}"),
            Directive::Env { name, value } => write!(f, "ENV {name}={value}"),
            Directive::Run(command) => write!(f, "RUN {command}"),
            Directive::Cmd(argv) => {
                f.write_str("CMD [")?;
                for (i, arg) in argv.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "\"{arg}\"")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// One `FROM` block. An unnamed stage can only be the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: Option<String>,
    pub base: StageBase,
    pub directives: Vec<Directive>,
}

impl Stage {
    fn named(name: &str, base: StageBase) -> Self {
        Self {
            name: Some(name.to_owned()),
            base,
            directives: Vec::new(),
        }
    }

    fn push(&mut self, directive: Directive) {
        self.directives.push(directive);
    }
}

/// The ordered stage graph for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub stages: Vec<Stage>,
}

impl BuildSpec {
    /// Plan the stage graph for `manifest`, pinned by `lock` when given.
    pub fn plan(manifest: &Manifest, lock: Option<&Lock>, options: &GenerateOptions) -> Self {
        let base = Stage::named(BASE_STAGE, StageBase::Image(base_image(manifest, lock, options)));

        let mut sources = Stage::named(SOURCES_STAGE, StageBase::Stage(BASE_STAGE.to_owned()));
        if let Some(proxy) = &options.proxy {
            sources.push(Directive::env("http_proxy", proxy.clone()));
        }
        sources.push(Directive::run("apt-get update"));

        let mut build = Stage::named(BUILD_STAGE, StageBase::Stage(SOURCES_STAGE.to_owned()));
        build.push(Directive::Arg {
            name: "DEBIAN_FRONTEND".to_owned(),
            value: "noninteractive".to_owned(),
        });
        build.push(Directive::run(continued(&[
            "apt-get update &&".to_owned(),
            "  apt-get install -y".to_owned(),
            "   --no-install-recommends".to_owned(),
            "   debootstrap".to_owned(),
        ])));
        build.push(Directive::env(ROOTFS_VAR, ROOTFS_PATH));
        build.push(Directive::run(continued(&[
            "debootstrap".to_owned(),
            format!("  --arch {}", options.architecture),
            "  --variant=minbase".to_owned(),
            format!("  {}", manifest.distro),
            format!("  ${{{ROOTFS_VAR}}} {}", options.mirror),
        ])));

        let locked = lock.filter(|lock| !lock.packages.is_empty());
        if let Some(lock) = locked {
            let specs: Vec<String> = lock
                .packages
                .iter()
                .map(|(name, pkg)| format!("{name}={}", pkg.version))
                .collect();
            let names: Vec<String> = lock.packages.keys().map(ToString::to_string).collect();
            build.push(Directive::run(chroot_install(&specs, Some(&names))));
        }

        let explicit: Vec<String> = manifest
            .packages
            .iter()
            .map(|(name, spec)| spec.install_arg(name))
            .collect();
        if !explicit.is_empty() {
            build.push(Directive::run(chroot_install(&explicit, None)));
        }

        if locked.is_some() {
            build.push(Directive::run("chroot $ROOTFS_PATH apt-get --purge -y autoremove"));
        }

        if let Some(lock) = lock {
            let hashes: Vec<String> = lock
                .hashed_packages()
                .map(|(_, pkg)| format!("{}  {}", pkg.filehash, pkg.filename))
                .collect();
            if !hashes.is_empty() {
                build.push(Directive::run(verify_hashes(&hashes)));
            }
        }

        let mut introspect = Stage::named(MANIFEST_STAGE, StageBase::Stage(BUILD_STAGE.to_owned()));
        introspect.push(Directive::run(format!(
            "chroot $ROOTFS_PATH apt list --installed -qq | tee {INSTALLED_LIST_PATH}"
        )));
        introspect.push(Directive::run(format!(
            "cd {ARCHIVES_DIR} && sha512sum *.deb | tee {DEB_HASHES_PATH}"
        )));

        let mut last = Stage {
            name: None,
            base: StageBase::Stage(BUILD_STAGE.to_owned()),
            directives: Vec::new(),
        };
        last.push(Directive::run(
            "rm -Rf $ROOTFS_PATH/var/cache/apt/* $ROOTFS_PATH/var/lib/apt/lists/*",
        ));
        last.push(Directive::run("rm -Rf $ROOTFS_PATH/usr/share/man/*"));
        last.push(Directive::run(
            "find $ROOTFS_PATH/var/log -type f -exec truncate -s0 {} \\;",
        ));
        last.push(Directive::Cmd(vec!["/usr/bin/bash".to_owned()]));
        if options.proxy.is_some() {
            last.push(Directive::env("http_proxy", ""));
        }

        Self {
            stages: vec![base, sources, build, introspect, last],
        }
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|stage| stage.name.as_deref() == Some(name))
    }

    /// Render to Dockerfile text. Stages are separated by a blank line.
    pub fn render(&self) -> Result<String, GenerateError> {
        let mut out = String::new();
        for stage in &self.stages {
            out.push('\n');
            write!(out, "FROM {}", stage.base)?;
            if let Some(name) = &stage.name {
                write!(out, " AS {name}")?;
            }
            out.push('\n');
            for directive in &stage.directives {
                writeln!(out, "{directive}")?;
            }
        }
        Ok(out)
    }
}

/// Generate the build specification text for `manifest` (and `lock`).
///
/// Identical inputs always produce byte-identical output, with no blank lines.
pub fn generate(
    manifest: &Manifest,
    lock: Option<&Lock>,
    options: &GenerateOptions,
) -> Result<String, GenerateError> {
    let rendered = BuildSpec::plan(manifest, lock, options).render()?;
    Ok(strip_blank_lines(&rendered))
}

/// Drop every empty or whitespace-only line, keeping the rest verbatim.
pub fn strip_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// The lock's pinned image when present, else the floating `<family>:<distro>-slim` tag.
pub fn base_image(manifest: &Manifest, lock: Option<&Lock>, options: &GenerateOptions) -> String {
    match lock {
        Some(lock) => lock.image.clone(),
        None => format!("{}:{}-slim", options.base_family, manifest.distro),
    }
}

fn continued(lines: &[String]) -> String {
    lines.join(" \\\n")
}

fn chroot_install(specs: &[String], mark_auto: Option<&[String]>) -> String {
    let mut lines = vec!["chroot $ROOTFS_PATH sh -c \"apt-get install -y --no-install-recommends".to_owned()];
    lines.extend(specs.iter().map(|spec| format!("\t{spec}")));
    if let Some(names) = mark_auto {
        lines.push("  && apt-mark auto".to_owned());
        lines.extend(names.iter().map(|name| format!("\t{name}")));
    }
    lines.push("  && true\"".to_owned());
    continued(&lines)
}

fn verify_hashes(hash_lines: &[String]) -> String {
    let mut lines = vec![
        format!("cd {ARCHIVES_DIR} &&"),
        "  rm -f SHASUMS".to_owned(),
    ];
    lines.extend(
        hash_lines
            .iter()
            .map(|line| format!("  && echo \"{line}\" >> SHASUMS")),
    );
    lines.push("  && sha512sum -c SHASUMS".to_owned());
    lines.push("  && rm -f SHASUMS".to_owned());
    continued(&lines)
}
