use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::store::DEFAULT_BLOCK_SIZE;

fn default_memory_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_disk_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_max_entries() -> usize {
    8192
}

fn default_max_entry_size() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default lifetime rule for validated responses without explicit freshness.
#[derive(Debug, Clone, Deserialize)]
pub struct MaxAgeRuleConfig {
    #[serde(default)]
    pub host: Option<String>,
    pub path: String,
    #[serde(default)]
    pub max_age: Option<u64>,
    #[serde(default)]
    pub s_maxage: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_memory_size")]
    pub memory_size: u64,
    #[serde(default = "default_disk_size")]
    pub disk_size: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: u64,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_true")]
    pub enable_range: bool,
    #[serde(default = "default_true")]
    pub enable_mmap: bool,
    #[serde(default)]
    pub rewrite_vary_as_private: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub admin_listen: Option<SocketAddr>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub max_age: Vec<MaxAgeRuleConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            memory_size: default_memory_size(),
            disk_size: default_disk_size(),
            max_entries: default_max_entries(),
            max_entry_size: default_max_entry_size(),
            block_size: default_block_size(),
            enable_range: true,
            enable_mmap: true,
            rewrite_vary_as_private: false,
            enabled: true,
            admin_listen: None,
            log: default_log_format(),
            max_age: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(config_path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("CACHEGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(config_path);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_entries > 0,
            "max_entries must be greater than 0 (got {})",
            self.max_entries
        );
        ensure!(
            self.max_entry_size > 0,
            "max_entry_size must be greater than 0 (got {})",
            self.max_entry_size
        );
        ensure!(
            self.block_size >= 512 && self.block_size.is_power_of_two(),
            "block_size must be a power of two of at least 512 (got {})",
            self.block_size
        );
        if self.cache_dir.is_some() {
            ensure!(
                self.disk_size > 0,
                "disk_size must be greater than 0 (got {})",
                self.disk_size
            );
        } else {
            ensure!(
                self.memory_size > 0,
                "memory_size must be greater than 0 when cache_dir is unset (got {})",
                self.memory_size
            );
        }
        for (idx, rule) in self.max_age.iter().enumerate() {
            if rule.max_age.is_none() && rule.s_maxage.is_none() {
                bail!("max_age rule {idx} sets neither max_age nor s_maxage");
            }
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cachegate/cachegate.toml"),
        PathBuf::from("cachegate.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
