use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_SERVER_PORT: u16 = 3001;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mount: MountSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSettings {
    /// Default mount point; `~` expands to the user's home directory.
    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    #[serde(default)]
    pub allow_other: bool,

    #[serde(default)]
    pub auto_unmount: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_deadline")]
    pub retry_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Attribute TTL in milliseconds; 0 disables the attribute cache.
    #[serde(default = "default_attr_ttl_ms")]
    pub attr_ttl_ms: u64,

    /// Directory-listing TTL in milliseconds; 0 disables the dirent cache.
    #[serde(default = "default_dir_ttl_ms")]
    pub dir_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(path.as_ref().display().to_string()))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file when present, defaults otherwise, then apply
    /// environment overrides.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        let file = match path {
            Some(p) => p,
            None => Self::config_dir()?.join("config.toml"),
        };
        let mut config = if file.exists() {
            Self::load(&file)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.timeout_secs == 0 {
            return Err(Error::Config(
                "remote.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.remote.retry_attempts == 0 {
            return Err(Error::Config(
                "remote.retry_attempts must be greater than 0".to_string(),
            ));
        }
        if self.mount.mount_point.is_empty() {
            return Err(Error::Config("mount.mount_point cannot be empty".to_string()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("REMOTEFS_FUSE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(mount_point) = std::env::var("REMOTEFS_FUSE_MOUNT_POINT") {
            self.mount.mount_point = mount_point;
        }
        if let Ok(ttl) = std::env::var("REMOTEFS_FUSE_ATTR_TTL_MS") {
            if let Ok(val) = ttl.parse() {
                self.cache.attr_ttl_ms = val;
            }
        }
        if let Ok(ttl) = std::env::var("REMOTEFS_FUSE_DIR_TTL_MS") {
            if let Ok(val) = ttl.parse() {
                self.cache.dir_ttl_ms = val;
            }
        }
    }

    /// Expand the configured mount point to an absolute path.
    pub fn mount_point(&self) -> PathBuf {
        expand_home(&self.mount.mount_point)
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.attr_ttl_ms)
    }

    pub fn dir_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.dir_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }

    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("remotefs-fuse"))
            .ok_or_else(|| Error::Config("could not determine config directory".to_string()))
    }

    pub fn runtime_dir() -> Result<PathBuf> {
        dirs::state_dir()
            .or_else(dirs::cache_dir)
            .map(|dir| dir.join("remotefs-fuse"))
            .ok_or_else(|| Error::Config("could not determine runtime directory".to_string()))
    }
}

/// Turn a bare server address into a base URL: `10.0.0.2` becomes
/// `http://10.0.0.2:3001`, a full URL passes through unchanged.
pub fn server_url(server: &str) -> Result<String> {
    let with_scheme = if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else if server.contains(':') {
        format!("http://{}", server)
    } else {
        format!("http://{}:{}", server, DEFAULT_SERVER_PORT)
    };

    let parsed = url::Url::parse(&with_scheme)
        .map_err(|_| Error::Config(format!("invalid server address: {}", server)))?;
    if parsed.host_str().is_none() {
        return Err(Error::Config(format!("invalid server address: {}", server)));
    }
    Ok(with_scheme.trim_end_matches('/').to_string())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            allow_other: false,
            auto_unmount: false,
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_deadline_secs: default_retry_deadline(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            attr_ttl_ms: default_attr_ttl_ms(),
            dir_ttl_ms: default_dir_ttl_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_mount_point() -> String {
    "~/mnt/remote-fs".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_deadline() -> u64 {
    10
}
fn default_attr_ttl_ms() -> u64 {
    2000
}
fn default_dir_ttl_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}
