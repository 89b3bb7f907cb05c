pub mod build;
pub mod completions;
pub mod dockerfile;
pub mod export;
pub mod man_pages;
pub mod update;

use aptlock_core::{Builder, BuilderConfig, BuilderOptions, ConfigError, CoreError};
use aptlock_engine::{BuildEngine, DockerEngine};
use aptlock_schema::{load_project, Project, ProjectError};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INPUT_ERROR: u8 = 2;
pub const EXIT_ENGINE_ERROR: u8 = 3;
pub const EXIT_DEADLINE: u8 = 4;

/// A failed command: the message to print and the exit code to return.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl Failure {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for Failure {
    fn from(err: CoreError) -> Self {
        let code = if matches!(err, CoreError::Timeout { .. }) {
            EXIT_DEADLINE
        } else if err.is_input_error() {
            EXIT_INPUT_ERROR
        } else if err.is_engine_error() {
            EXIT_ENGINE_ERROR
        } else {
            EXIT_FAILURE
        };
        Self::new(code, err.to_string())
    }
}

impl From<ProjectError> for Failure {
    fn from(err: ProjectError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<ConfigError> for Failure {
    fn from(err: ConfigError) -> Self {
        CoreError::from(err).into()
    }
}

/// Settings shared by every command that touches a project.
#[derive(Debug, Clone)]
pub struct Context {
    pub dir: PathBuf,
    pub manifest_name: String,
    pub lock_name: String,
    pub config: BuilderConfig,
    pub json: bool,
    pub progress: bool,
}

impl Context {
    pub fn load_project(&self) -> Result<Project, Failure> {
        let project = load_project(&self.dir, &self.manifest_name, &self.lock_name)?;
        tracing::info!(
            dir = %self.dir.display(),
            manifest = %self.manifest_name,
            lockfile = %self.lock_name,
            packages = project.manifest.package_count(),
            locked_packages = project.locked_package_count(),
            "parsed manifests"
        );
        Ok(project)
    }

    pub fn builder_options(&self) -> BuilderOptions {
        BuilderOptions {
            echo_progress: self.progress,
            ..BuilderOptions::from(&self.config)
        }
    }

    /// Connect to the local engine and wrap it in a builder.
    pub fn builder(&self) -> Result<Builder, Failure> {
        let engine = DockerEngine::connect().map_err(|e| {
            Failure::new(EXIT_ENGINE_ERROR, format!("connecting to build engine: {e}"))
        })?;
        Ok(self.builder_with(Arc::new(engine)))
    }

    pub fn builder_with(&self, engine: Arc<dyn BuildEngine>) -> Builder {
        Builder::new(engine, self.builder_options())
    }

    /// A spinner, unless output is JSON or build output is being echoed.
    pub fn spinner(&self, msg: &str) -> Option<ProgressBar> {
        if self.json || self.progress {
            None
        } else {
            Some(spinner(msg))
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, Failure> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Failure::new(EXIT_FAILURE, format!("JSON serialization failed: {e}")))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: Option<&ProgressBar>, msg: &str) {
    if let Some(pb) = pb {
        pb.set_style(ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.finish_with_message(format!("✓ {msg}"));
    }
}

pub fn spin_fail(pb: Option<&ProgressBar>, msg: &str) {
    if let Some(pb) = pb {
        pb.set_style(ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.finish_with_message(format!("✗ {msg}"));
    }
}
