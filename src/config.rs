use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "codecell.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Image overrides for built-in languages, keyed by language.
    #[serde(default)]
    pub images: HashMap<String, String>,
    /// Extra script-style languages declared without code changes.
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

/// Listener configuration for the `serve` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP transport binds to
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

/// Container runtime used to back sandboxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker's default OCI runtime (runc)
    #[default]
    Docker,
    /// gVisor user-space kernel (runsc)
    Gvisor,
}

impl RuntimeKind {
    /// The OCI runtime name passed to Docker, if not the daemon default.
    pub fn oci_runtime(self) -> Option<&'static str> {
        match self {
            Self::Docker => None,
            Self::Gvisor => Some("runsc"),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Gvisor => write!(f, "gvisor"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" | "runc" => Ok(Self::Docker),
            "gvisor" | "runsc" => Ok(Self::Gvisor),
            _ => bail!("Unknown container runtime: '{s}'. Supported: docker, gvisor"),
        }
    }
}

/// Hardening and resource limits applied to every sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container runtime selection
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Unprivileged user the program runs as
    #[serde(default = "default_user")]
    pub user: String,

    /// Memory limit (e.g., "512m"); swap is pinned to the same value
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU share (e.g., "1", "0.5")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Maximum number of processes
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Maximum number of open file descriptors
    #[serde(default = "default_nofile")]
    pub nofile_limit: i64,

    /// Largest file the program may write (e.g., "10m")
    #[serde(default = "default_file_size")]
    pub file_size_limit: String,

    /// Size of the writable no-exec scratch area at /tmp
    #[serde(default = "default_scratch_size")]
    pub scratch_size: String,

    /// Apply a storage quota to the container's writable layer
    #[serde(default)]
    pub enable_storage_opt: bool,

    /// Storage quota used when `enable_storage_opt` is set
    #[serde(default = "default_storage_quota")]
    pub storage_quota: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            user: default_user(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            nofile_limit: default_nofile(),
            file_size_limit: default_file_size(),
            scratch_size: default_scratch_size(),
            enable_storage_opt: false,
            storage_quota: default_storage_quota(),
        }
    }
}

/// Limits resolved from [`SandboxConfig`] into the units Docker expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids: i64,
    pub nofile: i64,
    pub file_size_bytes: i64,
    pub scratch_bytes: i64,
    pub storage_quota: Option<String>,
}

impl SandboxConfig {
    /// Resolve human-readable limits into byte and nano-CPU counts.
    pub fn limits(&self) -> Result<ResourceLimits> {
        let cpus: f64 = self
            .cpus
            .trim()
            .parse()
            .with_context(|| format!("Invalid CPU limit: {}", self.cpus))?;
        if !(cpus > 0.0 && cpus.is_finite()) {
            bail!("CPU limit must be positive, got {}", self.cpus);
        }
        if self.pids_limit <= 0 || self.nofile_limit <= 0 {
            bail!("Process and file descriptor limits must be positive");
        }

        // CPU counts are small, so the conversion cannot overflow
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;

        Ok(ResourceLimits {
            memory_bytes: parse_memory_limit(&self.memory)?,
            nano_cpus,
            pids: self.pids_limit,
            nofile: self.nofile_limit,
            file_size_bytes: parse_memory_limit(&self.file_size_limit)?,
            scratch_bytes: parse_memory_limit(&self.scratch_size)?,
            storage_quota: self
                .enable_storage_opt
                .then(|| self.storage_quota.clone()),
        })
    }
}

/// Per-request execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Requested timeouts above this are clamped
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,

    /// Outbound events buffered per session before the session waits on the client
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_timeout_secs: default_max_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// A script-style language declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Request key, e.g. "node"
    pub key: String,
    /// Image that carries the interpreter
    pub image: String,
    /// Command line, split with shell quoting rules
    pub command: String,
    /// File name the source code is written to
    pub file: String,
}

/// Values taken from command-line flags or the environment.
///
/// Each set field replaces the value loaded from the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub addr: Option<String>,
    pub runtime: Option<RuntimeKind>,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub enable_storage_opt: Option<bool>,
}

// Default value functions
fn default_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_user() -> String {
    "runner".to_string()
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_pids_limit() -> i64 {
    64
}

fn default_nofile() -> i64 {
    256
}

fn default_file_size() -> String {
    "10m".to_string()
}

fn default_scratch_size() -> String {
    "64m".to_string()
}

fn default_storage_quota() -> String {
    "256m".to_string()
}

fn default_max_timeout() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    256
}

impl Config {
    /// Load configuration, using defaults if no file is found.
    ///
    /// An explicit path must exist. Otherwise `codecell.toml` is looked up
    /// in the working directory, then in the user's config directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => discover_config_file(),
        };

        let Some(config_path) = path else {
            return Ok(Self::default());
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Apply flag/environment overrides on top of the loaded file.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(addr) = overrides.addr {
            self.server.addr = addr;
        }
        if let Some(runtime) = overrides.runtime {
            self.sandbox.runtime = runtime;
        }
        if let Some(memory) = overrides.memory_limit {
            self.sandbox.memory = memory;
        }
        if let Some(cpus) = overrides.cpu_limit {
            self.sandbox.cpus = cpus;
        }
        if let Some(enabled) = overrides.enable_storage_opt {
            self.sandbox.enable_storage_opt = enabled;
        }
    }

    /// Check everything that would otherwise fail at the first request.
    pub fn validate(&self) -> Result<()> {
        self.sandbox.limits()?;
        if self.execution.max_timeout_secs == 0 {
            bail!("execution.max_timeout_secs must be positive");
        }
        if self.execution.event_buffer == 0 {
            bail!("execution.event_buffer must be positive");
        }
        for language in &self.languages {
            if language.key.trim().is_empty() {
                bail!("Language entries need a non-empty key");
            }
            let argv = shell_words::split(&language.command)
                .with_context(|| format!("Invalid command for language '{}'", language.key))?;
            if argv.is_empty() {
                bail!("Language '{}' has an empty command", language.key);
            }
        }
        Ok(())
    }
}

fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }

    let user = dirs::config_dir()?.join("codecell").join(CONFIG_FILE);
    user.exists().then_some(user)
}

/// Parse memory limit string (e.g., "1g", "512m", "64k") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        let kilos: i64 = num.parse().context("Invalid memory limit")?;
        Ok(kilos * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}
