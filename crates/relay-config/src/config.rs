use std::path::{Path, PathBuf};

use relay_types::{RelayError, Result};
use tracing::debug;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_name: String,

    // Paths
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
    pub groups_dir: PathBuf,
    pub db_path: PathBuf,
    pub global_memory_path: PathBuf,

    // Assistant
    pub assistant_name: String,
    pub trigger_pattern: Option<String>,
    pub main_group_folder: String,

    // Container
    pub container_runtime: String,
    pub container_image: String,
    /// Default invocation timeout in seconds.
    pub container_timeout: u64,
    pub container_max_output_size: usize,
    /// Host roots that extra mounts must live under. Empty blocks every extra mount.
    pub mount_allowlist: Vec<PathBuf>,

    // Queue
    pub debounce_ms: u64,
    pub max_pending_messages: usize,

    // Polling
    pub scheduler_poll_interval_ms: u64,
    pub ipc_poll_interval_ms: u64,

    // Logging
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_json: bool,
}

impl Config {
    /// Defaults rooted at `base`, ignoring the environment.
    pub fn with_base_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let data_dir = base.join("data");
        let store_dir = base.join("store");
        let groups_dir = base.join("groups");

        Config {
            project_name: "AgentRelay".to_string(),
            db_path: store_dir.join("relay.db"),
            global_memory_path: groups_dir.join("global").join("MEMORY.md"),
            base_dir: base,
            data_dir,
            store_dir,
            groups_dir,

            assistant_name: "Andy".to_string(),
            trigger_pattern: None,
            main_group_folder: "main".to_string(),

            container_runtime: "docker".to_string(),
            container_image: "relay-agent:latest".to_string(),
            container_timeout: 300,
            container_max_output_size: 10 * 1024 * 1024,
            mount_allowlist: Vec::new(),

            debounce_ms: 3000,
            max_pending_messages: 100,

            scheduler_poll_interval_ms: 60_000,
            ipc_poll_interval_ms: 1000,

            log_level: "info".to_string(),
            log_file: None,
            log_json: false,
        }
    }

    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // A missing .env is fine
        let _ = dotenvy::dotenv();

        let base = match std::env::var("BASE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::current_dir().map_err(|e| {
                RelayError::Config(format!("Cannot determine working directory: {e}"))
            })?,
        };
        let defaults = Self::with_base_dir(&base);

        let data_dir = env_path_or("DATA_DIR", || defaults.data_dir.clone());
        let store_dir = env_path_or("STORE_DIR", || defaults.store_dir.clone());
        let groups_dir = env_path_or("GROUPS_DIR", || defaults.groups_dir.clone());

        let config = Config {
            project_name: env_or("PROJECT_NAME", || defaults.project_name.clone()),

            db_path: env_path_or("DB_PATH", || store_dir.join("relay.db")),
            global_memory_path: env_path_or("GLOBAL_MEMORY_PATH", || {
                groups_dir.join("global").join("MEMORY.md")
            }),
            base_dir: base,
            data_dir,
            store_dir,
            groups_dir,

            assistant_name: env_or("ASSISTANT_NAME", || defaults.assistant_name.clone()),
            trigger_pattern: env_opt("TRIGGER_PATTERN"),
            main_group_folder: env_or("MAIN_GROUP_FOLDER", || {
                defaults.main_group_folder.clone()
            }),

            container_runtime: env_or("CONTAINER_RUNTIME", || {
                defaults.container_runtime.clone()
            }),
            container_image: env_or("CONTAINER_IMAGE", || defaults.container_image.clone()),
            container_timeout: env_u64("CONTAINER_TIMEOUT", defaults.container_timeout),
            container_max_output_size: env_usize(
                "CONTAINER_MAX_OUTPUT_SIZE",
                defaults.container_max_output_size,
            ),
            mount_allowlist: env_opt("MOUNT_ALLOWLIST")
                .map(|v| parse_path_list(&v))
                .unwrap_or_default(),

            debounce_ms: env_u64("DEBOUNCE_MS", defaults.debounce_ms),
            max_pending_messages: env_usize(
                "MAX_PENDING_MESSAGES",
                defaults.max_pending_messages,
            ),

            scheduler_poll_interval_ms: env_u64(
                "SCHEDULER_POLL_INTERVAL_MS",
                defaults.scheduler_poll_interval_ms,
            ),
            ipc_poll_interval_ms: env_u64("IPC_POLL_INTERVAL_MS", defaults.ipc_poll_interval_ms),

            log_level: env_or("LOG_LEVEL", || defaults.log_level.clone()),
            log_file: env_opt("LOG_FILE").map(PathBuf::from),
            log_json: env_bool("LOG_JSON", false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.container_timeout == 0 {
            return Err(RelayError::Config(
                "CONTAINER_TIMEOUT must be greater than zero".to_string(),
            ));
        }
        if self.scheduler_poll_interval_ms == 0 || self.ipc_poll_interval_ms == 0 {
            return Err(RelayError::Config(
                "Polling intervals must be greater than zero".to_string(),
            ));
        }
        if self.main_group_folder.is_empty() {
            return Err(RelayError::Config(
                "MAIN_GROUP_FOLDER must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Trigger phrase used for groups registered without an explicit one.
    pub fn default_trigger(&self) -> String {
        self.trigger_pattern
            .clone()
            .unwrap_or_else(|| format!("@{}", self.assistant_name))
    }

    /// Root of the per-folder mailboxes.
    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    /// Root of the per-folder agent session areas.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Create required directories.
    pub fn create_directories(&self) -> Result<()> {
        let mut dirs = vec![
            self.data_dir.clone(),
            self.store_dir.clone(),
            self.groups_dir.clone(),
            self.ipc_dir(),
            self.ipc_dir().join("errors"),
            self.sessions_dir(),
        ];
        if let Some(parent) = self.db_path.parent() {
            dirs.push(parent.to_path_buf());
        }
        if let Some(parent) = self.log_file.as_deref().and_then(Path::parent) {
            dirs.push(parent.to_path_buf());
        }

        for dir in dirs.iter().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                RelayError::Config(format!(
                    "Failed to create directory {}: {e}",
                    dir.display()
                ))
            })?;
            debug!(dir = %dir.display(), "Ensured directory");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    env_opt(key).unwrap_or_else(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path_or(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    env_opt(key).map(PathBuf::from).unwrap_or_else(default)
}

fn parse_path_list(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}
