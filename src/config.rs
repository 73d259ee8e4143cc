use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `output.config_dir`
pub const CONFIG_DIR_ENV: &str = "PROXYDECK_CONFIG_DIR";

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API and process settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Where hosts, access lists and settings are persisted
    #[serde(default)]
    pub store: StoreConfig,

    /// Where the proxy's configuration artifacts are written
    #[serde(default)]
    pub output: OutputConfig,

    /// How the proxy is told to pick up new artifacts
    #[serde(default)]
    pub reload: ReloadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Admin API port (default: 3001)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file (default: data/proxydeck.db)
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Directory the proxy loads its configuration from
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Mode of `access-lists.yaml`, which carries basic-auth passwords
    /// (default: 0o640). Must grant nothing to other users.
    #[serde(default = "default_secret_file_mode")]
    pub secret_file_mode: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            secret_file_mode: default_secret_file_mode(),
        }
    }
}

impl OutputConfig {
    pub fn config_dir(&self) -> PathBuf {
        PathBuf::from(&self.config_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReloadConfig {
    /// Supervisor invocation that signals the proxy, split like a shell would.
    /// An empty string skips straight to the pid file.
    #[serde(default = "default_supervisor_command")]
    pub supervisor_command: String,

    /// PID file written by the proxy process
    #[serde(default = "default_proxy_pid_file")]
    pub pid_file: Option<String>,

    /// Signal name: HUP, USR1 or USR2 (default: HUP)
    #[serde(default = "default_reload_signal")]
    pub signal: String,

    /// Upper bound for each reload strategy in seconds (default: 5)
    #[serde(default = "default_reload_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            supervisor_command: default_supervisor_command(),
            pid_file: default_proxy_pid_file(),
            signal: default_reload_signal(),
            timeout_secs: default_reload_timeout(),
        }
    }
}

impl ReloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    3001
}

fn default_store_path() -> String {
    "data/proxydeck.db".to_string()
}

fn default_secret_file_mode() -> u32 {
    crate::sync::DEFAULT_SECRET_ARTIFACT_MODE
}

fn default_config_dir() -> String {
    "/etc/proxy/conf.d".to_string()
}

fn default_supervisor_command() -> String {
    "supervisorctl signal HUP proxy".to_string()
}

fn default_proxy_pid_file() -> Option<String> {
    Some("/run/proxy.pid".to_string())
}

fn default_reload_signal() -> String {
    "HUP".to_string()
}

fn default_reload_timeout() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the environment; `lookup` is `std::env::var` outside tests
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(CONFIG_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.output.config_dir = dir;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.admin_port == 0 {
            errors.push("server.admin_port must be greater than 0".to_string());
        }

        if self.store.path.trim().is_empty() {
            errors.push("store.path must not be empty".to_string());
        }

        if self.output.config_dir.trim().is_empty() {
            errors.push("output.config_dir must not be empty".to_string());
        }

        if self.output.secret_file_mode & !0o777 != 0 || self.output.secret_file_mode & 0o007 != 0 {
            errors.push(format!(
                "output.secret_file_mode {:#o} must be a permission mode with no access for others",
                self.output.secret_file_mode
            ));
        }

        if let (Some(ours), Some(proxy)) = (&self.server.pid_file, &self.reload.pid_file) {
            if same_file(Path::new(ours), Path::new(proxy)) {
                errors.push(format!(
                    "reload.pid_file '{}' is this daemon's own server.pid_file",
                    proxy
                ));
            }
        }

        if self.reload.timeout_secs == 0 {
            errors.push("reload.timeout_secs must be greater than 0".to_string());
        }

        if crate::reload::ReloadSignal::parse(&self.reload.signal).is_none() {
            errors.push(format!(
                "reload.signal '{}' is not one of HUP, USR1, USR2",
                self.reload.signal
            ));
        }

        if let Err(e) = shell_words::split(&self.reload.supervisor_command) {
            errors.push(format!("reload.supervisor_command cannot be parsed: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Path equality, resolving symlinks when both paths exist
fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
