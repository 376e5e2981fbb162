use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewaySettings,
    pub dispatcher: DispatcherSettings,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub executors: ExecutorSettings,
}

/// Front-end HTTP service settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: String,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub enable_cache: bool,
    pub enable_rate_limit: bool,
    /// Address of the dispatcher used for `full` scrapes
    pub processing_addr: String,
    pub connect_timeout_secs: u64,
    /// Ceiling for a whole dispatcher round-trip
    pub request_timeout_secs: u64,
}

/// How the dispatcher runs its jobs
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Child processes of this binary running the `worker` subcommand
    Process,
    /// Tokio tasks inside the dispatcher process
    InProcess,
}

/// Backend dispatcher settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherSettings {
    pub bind: String,
    /// Number of pool slots; defaults to the available parallelism
    pub pool_size: Option<usize>,
    pub task_timeout_secs: u64,
    /// How long a connection may take to deliver its request
    pub read_timeout_secs: u64,
    /// How long shutdown waits for in-flight connections before aborting them
    pub shutdown_grace_secs: u64,
    pub worker_mode: WorkerMode,
}

/// Per-domain sliding window settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub window_secs: u64,
}

/// Response cache settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub key_prefix: String,
}

/// Shared key-value store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreSettings {
    pub store_type: String, // "redis", "memory"
    pub redis_url: String,
}

/// Settings handed to the task executors
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutorSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub page_load_timeout_secs: u64,
    pub max_images: usize,
    pub max_links: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            fetch_timeout_secs: 30,
            user_agent: format!("pagegate/{}", env!("CARGO_PKG_VERSION")),
            enable_cache: true,
            enable_rate_limit: true,
            processing_addr: "127.0.0.1:9000".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 90,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9000".to_string(),
            pool_size: None,
            task_timeout_secs: 60,
            read_timeout_secs: 30,
            shutdown_grace_secs: 90,
            worker_mode: WorkerMode::Process,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            key_prefix: "scraper".to_string(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            store_type: "redis".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            viewport_width: 1920,
            viewport_height: 1080,
            page_load_timeout_secs: 30,
            max_images: 20,
            max_links: 50,
        }
    }
}

impl GatewaySettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl DispatcherSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Pool size, falling back to the machine's available parallelism
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size
            .filter(|size| *size > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "pagegate", "pagegate") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the configuration from `path`, or from the default location.
    ///
    /// A missing default file is created with default values; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            if let Err(e) = config.save_to_file(&config_path) {
                // Read-only homes still get a working default
                error!("Failed to write default configuration: {}", e);
            }
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Parse configuration from YAML text; omitted keys keep their defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
