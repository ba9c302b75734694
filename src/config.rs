use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration: one entry per mount, keyed by mount name.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mounts: HashMap<String, MountConfig>,
}

/// Static description of one mount.
///
/// `read_command` and `name_separator` at this level apply to the mount root
/// and fall back to the `directory` sub-table when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    pub path: String,
    #[serde(default)]
    pub read_command: Option<String>,
    #[serde(default)]
    pub name_separator: Option<String>,
    #[serde(default = "default_dir_mode")]
    pub mode: u32,
    /// Worker pool size; zero resolves to the host CPU count.
    #[serde(default)]
    pub thread_count: usize,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub cache_seconds: u64,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub file: FileConfig,
}

/// Defaults scoped to directory entries discovered under a mount.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub read_command: Option<String>,
    #[serde(default)]
    pub name_separator: Option<String>,
    #[serde(default = "default_dir_mode")]
    pub mode: u32,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub cache_seconds: u64,
}

/// Defaults scoped to file entries discovered under a mount.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub read_command: Option<String>,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub cache_seconds: u64,
}

fn default_dir_mode() -> u32 {
    0o755
}

fn default_file_mode() -> u32 {
    0o644
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            read_command: None,
            name_separator: None,
            mode: default_dir_mode(),
            cache: false,
            cache_seconds: 0,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            read_command: None,
            mode: default_file_mode(),
            cache: false,
            cache_seconds: 0,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}
