//! Engine configuration and its YAML persistence.
//!
//! [`EngineConfig::from_yaml_str`] is strict and reports every problem;
//! [`load_config`] is the forgiving entry point for config files and falls
//! back to defaults with a warning.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which scheduling granularity the threaded interpreter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
    /// Fork and join around every process.
    #[default]
    PerNode,
    /// Fork once per channel chain and join at its end.
    PerChain,
}

/// Execution strategy for a full pass over the instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpreter {
    /// Everything on the calling thread.
    Standard,
    /// Channel-sliced workers where modules allow it.
    #[default]
    Threaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count; 1 runs serially.
    pub num_threads: usize,
    pub thread_mode: ThreadingMode,
    pub interpreter: Interpreter,
    /// Seed handed to the builder; each process derives its own from it.
    pub base_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            thread_mode: ThreadingMode::PerNode,
            interpreter: Interpreter::Threaded,
            base_seed: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_thread_mode(mut self, thread_mode: ThreadingMode) -> Self {
        self.thread_mode = thread_mode;
        self
    }

    pub fn with_interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_base_seed(mut self, base_seed: u64) -> Self {
        self.base_seed = base_seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::Invalid("num_threads must be at least 1".into()));
        }
        Ok(())
    }

    /// Parse and validate a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Load a config file.
///
/// A missing file yields the defaults. An unreadable, malformed or invalid
/// file is logged and also yields the defaults.
pub fn load_config(path: &Path) -> EngineConfig {
    log::info!("load_config: loading {:?}", path);

    if !path.exists() {
        log::info!("load_config: {:?} does not exist, using defaults", path);
        return EngineConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match EngineConfig::from_yaml_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("load_config: {}, using defaults", e);
                EngineConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: failed to read {:?}: {}, using defaults", path, e);
            EngineConfig::default()
        }
    }
}

/// Write `config` as YAML, creating parent directories as needed.
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let yaml = config.to_yaml()?;
    std::fs::write(path, yaml).map_err(io_err)?;
    log::info!("save_config: wrote {:?}", path);
    Ok(())
}
