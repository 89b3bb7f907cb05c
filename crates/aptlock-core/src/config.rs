use crate::buildspec::GenerateOptions;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "APTLOCK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: '{value}'")]
    Invalid { field: &'static str, value: String },
}

/// Host-level builder settings, from `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    pub proxy: Option<String>,
    pub mirror: String,
    pub architecture: String,
    pub timeout_secs: u64,
    pub base_family: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let generate = GenerateOptions::default();
        Self {
            proxy: generate.proxy,
            mirror: generate.mirror,
            architecture: generate.architecture,
            timeout_secs: 300,
            base_family: generate.base_family,
        }
    }
}

impl BuilderConfig {
    /// Load from an explicit path. The file must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Load from `explicit`, else `$APTLOCK_CONFIG`, else the per-user default.
    ///
    /// Only the per-user default may be absent, in which case defaults apply.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return Self::load(Path::new(&path));
        }
        let Some(path) = default_config_path() else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content, &path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot be interpolated into build commands safely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, &str); 3] = [
            ("mirror", &self.mirror),
            ("architecture", &self.architecture),
            ("base_family", &self.base_family),
        ];
        for (field, value) in checks {
            if !is_shell_word(value) {
                return Err(ConfigError::Invalid {
                    field,
                    value: value.to_owned(),
                });
            }
        }
        if let Some(proxy) = self.proxy.as_deref().filter(|p| !p.is_empty()) {
            if !is_shell_word(proxy) {
                return Err(ConfigError::Invalid {
                    field: "proxy",
                    value: proxy.to_owned(),
                });
            }
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout_secs",
                value: "0".to_owned(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            proxy: self.proxy.clone().filter(|p| !p.is_empty()),
            mirror: self.mirror.clone(),
            architecture: self.architecture.clone(),
            base_family: self.base_family.clone(),
        }
    }
}

fn is_shell_word(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._~:/?#[]@%+=,".contains(c))
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(xdg).join("aptlock/config.toml"));
    }
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/aptlock/config.toml"))
}
