use serde::Deserialize;
use std::{
    env,
    path::{Path, PathBuf},
};
use strand_types::ErrorPolicy;

use crate::scheduler::SchedulerConfig;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "STRAND_CONFIG";

/// `STRAND_ENV=test` turns the safety wrapper off.
pub const ENV_NAME_VAR: &str = "STRAND_ENV";

// Default value function for serde (bool::default() is false, so only true needs a fn)
pub(crate) const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct StrandConfig {
    pub scheduler: Option<SchedulerSection>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Deserialize)]
pub struct SchedulerSection {
    /// Log failures in scheduled work instead of letting them escape. Default: true.
    #[serde(default = "default_true")]
    pub safety_wrapper: bool,
    /// Allow lifecycle hooks on scheduled operations. Default: true.
    #[serde(default = "default_true")]
    pub hooks_enabled: bool,
    /// What `run()` does with an escaping failure. Default: log.
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            safety_wrapper: true,
            hooks_enabled: true,
            error_policy: ErrorPolicy::Log,
        }
    }
}

impl StrandConfig {
    /// Load from `$STRAND_CONFIG` or `~/.strand/config.toml`.
    ///
    /// A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Resolve the runtime switches, applying the `STRAND_ENV` override.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        self.scheduler_config_for(env::var(ENV_NAME_VAR).ok().as_deref())
    }

    /// Like [`scheduler_config`](Self::scheduler_config) with an explicit
    /// environment name.
    #[must_use]
    pub fn scheduler_config_for(&self, env_name: Option<&str>) -> SchedulerConfig {
        let defaults = SchedulerSection::default();
        let section = self.scheduler.as_ref().unwrap_or(&defaults);
        let mut config = SchedulerConfig {
            safety_wrapper: section.safety_wrapper,
            hooks_enabled: section.hooks_enabled,
            error_policy: section.error_policy,
        };
        if env_name.is_some_and(|name| name.eq_ignore_ascii_case("test")) {
            config.safety_wrapper = false;
        }
        config
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".strand").join("config.toml"))
}
