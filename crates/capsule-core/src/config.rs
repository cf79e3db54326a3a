use crate::error::{CapsuleError, CapsuleResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under `$HOME` holding the config file and the global volume.
pub const CONFIG_DIR: &str = ".capsule";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "CAPSULE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VolumeCfg {
    #[serde(default = "default_size_gb")]
    pub default_size_gb: u32,

    #[serde(default = "default_min_size_gb")]
    pub min_size_gb: u32,

    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: u32,

    /// Parent directory for generated mount points.
    #[serde(default = "default_mount_root")]
    pub mount_root: String,

    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    #[serde(default)]
    pub hdiutil_path: Option<String>,

    #[serde(default)]
    pub cryptsetup_path: Option<String>,
}

fn default_size_gb() -> u32 {
    2
}

fn default_min_size_gb() -> u32 {
    1
}

fn default_max_size_gb() -> u32 {
    100
}

fn default_mount_root() -> String {
    "/tmp".to_string()
}

fn default_create_timeout_secs() -> u64 {
    600
}

fn default_open_timeout_secs() -> u64 {
    120
}

fn default_query_timeout_secs() -> u64 {
    10
}

impl Default for VolumeCfg {
    fn default() -> Self {
        Self {
            default_size_gb: default_size_gb(),
            min_size_gb: default_min_size_gb(),
            max_size_gb: default_max_size_gb(),
            mount_root: default_mount_root(),
            create_timeout_secs: default_create_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            hdiutil_path: None,
            cryptsetup_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContainerCfg {
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default)]
    pub runtime_path: Option<String>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// Throwaway image used for cache refresh and cache drop helpers.
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
}

fn default_image() -> String {
    "capsule:latest".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_helper_image() -> String {
    "alpine:latest".to_string()
}

impl Default for ContainerCfg {
    fn default() -> Self {
        Self {
            image: default_image(),
            runtime_path: None,
            command_timeout_secs: default_command_timeout_secs(),
            shell: default_shell(),
            helper_image: default_helper_image(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    /// Wait between closing and reopening the volume after a cache conflict.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Wait after removing a stale container so the runtime drops its mounts.
    #[serde(default = "default_release_delay_ms")]
    pub release_delay_ms: u64,

    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,

    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_release_delay_ms() -> u64 {
    1000
}

fn default_ready_attempts() -> u32 {
    10
}

fn default_ready_delay_ms() -> u64 {
    500
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            release_delay_ms: default_release_delay_ms(),
            ready_attempts: default_ready_attempts(),
            ready_delay_ms: default_ready_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GuardCfg {
    #[serde(default = "default_guard_enabled")]
    pub enabled: bool,
}

fn default_guard_enabled() -> bool {
    true
}

impl Default for GuardCfg {
    fn default() -> Self {
        Self {
            enabled: default_guard_enabled(),
        }
    }
}

/// Supported on-disk config encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CapsuleConfig {
    #[serde(default)]
    pub volume: VolumeCfg,

    #[serde(default)]
    pub container: ContainerCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(default)]
    pub guard: GuardCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl CapsuleConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CapsuleResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = ConfigFormat::for_path(path);
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = Some(path.to_path_buf());
        cfg.format = format;

        let issues = cfg.validate();
        if let Some(first) = issues.first() {
            return Err(CapsuleError::InvalidConfig(first.clone()));
        }
        Ok(cfg)
    }

    /// Load the explicit file if given, else `$CAPSULE_CONFIG`, else the
    /// default location. Only the default location may be absent.
    pub fn discover(explicit: Option<&Path>) -> CapsuleResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Collect every problem with the config instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let volume = &self.volume;
        if volume.min_size_gb == 0 {
            issues.push("volume.min_size_gb must be at least 1".to_string());
        }
        if volume.min_size_gb > volume.max_size_gb {
            issues.push(format!(
                "volume.min_size_gb ({}) exceeds volume.max_size_gb ({})",
                volume.min_size_gb, volume.max_size_gb
            ));
        }
        if volume.default_size_gb < volume.min_size_gb
            || volume.default_size_gb > volume.max_size_gb
        {
            issues.push(format!(
                "volume.default_size_gb ({}) is outside {}..={}",
                volume.default_size_gb, volume.min_size_gb, volume.max_size_gb
            ));
        }
        if !Path::new(&volume.mount_root).is_absolute() {
            issues.push(format!(
                "volume.mount_root must be absolute, got {}",
                volume.mount_root
            ));
        }
        for (name, value) in [
            ("volume.create_timeout_secs", volume.create_timeout_secs),
            ("volume.open_timeout_secs", volume.open_timeout_secs),
            ("volume.query_timeout_secs", volume.query_timeout_secs),
            (
                "container.command_timeout_secs",
                self.container.command_timeout_secs,
            ),
        ] {
            if value == 0 {
                issues.push(format!("{name} must be greater than zero"));
            }
        }
        if self.container.image.trim().is_empty() {
            issues.push("container.image must not be empty".to_string());
        }
        if self.container.shell.trim().is_empty() {
            issues.push("container.shell must not be empty".to_string());
        }
        issues
    }

    pub fn mount_root(&self) -> PathBuf {
        PathBuf::from(&self.volume.mount_root)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.volume.create_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.volume.open_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.volume.query_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.container.command_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.retry.settle_delay_ms)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.retry.release_delay_ms)
    }

    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.retry.ready_delay_ms)
    }

    /// Reject capacities outside the configured bounds before touching disk.
    pub fn check_capacity(&self, size_gb: u32) -> CapsuleResult<()> {
        let volume = &self.volume;
        if size_gb < volume.min_size_gb || size_gb > volume.max_size_gb {
            return Err(CapsuleError::InvalidConfig(format!(
                "volume size must be between {} and {} GB, got {}",
                volume.min_size_gb, volume.max_size_gb, size_gb
            )));
        }
        Ok(())
    }
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Toml,
        }
    }
}

/// `$HOME/.capsule`, when a home directory is known.
pub fn capsule_home() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(CONFIG_DIR))
}

pub fn default_config_path() -> Option<PathBuf> {
    capsule_home().map(|dir| dir.join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_applies_defaults_for_missing_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[container]\nimage = \"dev:1\"\n").unwrap();

        let cfg = CapsuleConfig::load(&path).unwrap();
        assert_eq!(cfg.container.image, "dev:1");
        assert_eq!(cfg.volume.default_size_gb, 2);
        assert_eq!(cfg.retry.settle_delay_ms, 2000);
        assert!(cfg.guard.enabled);
        assert_eq!(cfg.format, ConfigFormat::Toml);
        assert_eq!(cfg.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn load_reads_yaml_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "volume:\n  mount_root: /var/tmp\n").unwrap();

        let cfg = CapsuleConfig::load(&path).unwrap();
        assert_eq!(cfg.format, ConfigFormat::Yaml);
        assert_eq!(cfg.mount_root(), PathBuf::from("/var/tmp"));
    }

    #[test]
    fn load_rejects_relative_mount_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[volume]\nmount_root = \"mounts\"\n").unwrap();

        let err = CapsuleConfig::load(&path).unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidConfig(_)));
    }

    #[test]
    fn validate_collects_every_issue() {
        let mut cfg = CapsuleConfig::default();
        cfg.volume.min_size_gb = 10;
        cfg.volume.max_size_gb = 5;
        cfg.container.image = " ".into();
        cfg.volume.open_timeout_secs = 0;

        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.contains("exceeds")));
        assert!(issues.iter().any(|i| i.contains("container.image")));
        assert!(issues.iter().any(|i| i.contains("open_timeout_secs")));
    }

    #[test]
    fn check_capacity_enforces_bounds() {
        let cfg = CapsuleConfig::default();
        assert!(cfg.check_capacity(1).is_ok());
        assert!(cfg.check_capacity(100).is_ok());
        assert!(matches!(
            cfg.check_capacity(0),
            Err(CapsuleError::InvalidConfig(_))
        ));
        assert!(matches!(
            cfg.check_capacity(101),
            Err(CapsuleError::InvalidConfig(_))
        ));
    }
}
