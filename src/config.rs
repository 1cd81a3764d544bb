//! Configuration for the sandbox manager.
//!
//! All state lives under a single root directory passed explicitly as
//! [`AgentPaths`]. An optional `config.toml` in that root overrides defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::sandbox::{AuthMode, ResourceSpec, SyncMode};

/// Environment variable overriding the configuration root.
pub const HOME_ENV: &str = "KEYSTONE_AGENT_HOME";

/// Default host port for the first sandbox's remote channel.
pub const DEFAULT_SSH_PORT: u16 = 2223;

/// Default user inside the guest.
pub const DEFAULT_SSH_USER: &str = "sandbox";

/// Conventional build-output directories copied back by `sync --artifacts`.
pub const DEFAULT_ARTIFACT_DIRS: &[&str] = &["target", "dist", "build", "out", "result"];

/// Filesystem layout under the configuration root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    /// Uses `root` as the configuration root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the root: explicit value, then `KEYSTONE_AGENT_HOME`, then
    /// `<config_dir>/keystone/agent`.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(root) = std::env::var_os(HOME_ENV) {
            return Ok(Self::new(root));
        }
        let base = dirs::config_dir()
            .ok_or_else(|| Error::Config("cannot determine configuration directory".into()))?;
        Ok(Self::new(base.join("keystone").join("agent")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The registry document.
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("sandboxes.json")
    }

    /// Advisory lock serializing registry writers.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("sandboxes.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.root.join("sandboxes")
    }

    /// State directory of one sandbox.
    pub fn sandbox_dir(&self, name: &str) -> PathBuf {
        self.sandboxes_dir().join(name)
    }
}

/// Defaults applied to new sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxDefaults {
    #[serde(flatten)]
    pub resources: ResourceSpecToml,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub auth_mode: AuthMode,
}

/// Resource spec as read from TOML (snake_case keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpecToml {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u32,
    #[serde(default)]
    pub nested_virtualization: bool,
    #[serde(default)]
    pub network_mode: crate::sandbox::NetworkMode,
}

fn default_memory_mb() -> u32 {
    4096
}

fn default_vcpu_count() -> u32 {
    2
}

impl Default for ResourceSpecToml {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            vcpu_count: default_vcpu_count(),
            nested_virtualization: false,
            network_mode: Default::default(),
        }
    }
}

impl From<&ResourceSpecToml> for ResourceSpec {
    fn from(toml: &ResourceSpecToml) -> Self {
        Self {
            memory_mb: toml.memory_mb,
            vcpu_count: toml.vcpu_count,
            nested_virtualization_enabled: toml.nested_virtualization,
            network_mode: toml.network_mode,
        }
    }
}

/// Remote command channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Guest password, used when the auth mode is `password`.
    #[serde(default = "default_ssh_user")]
    pub password: String,
    /// First port handed out to sandboxes.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Public keys tried, in order, for public-key auth. Relative paths are
    /// resolved against the home directory.
    #[serde(default = "default_public_keys")]
    pub public_keys: Vec<PathBuf>,
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_base_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_public_keys() -> Vec<PathBuf> {
    vec![
        PathBuf::from(".ssh/id_ed25519.pub"),
        PathBuf::from(".ssh/id_rsa.pub"),
        PathBuf::from(".ssh/id_ecdsa.pub"),
    ]
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            password: default_ssh_user(),
            base_port: default_base_port(),
            connect_timeout_secs: default_connect_timeout(),
            public_keys: default_public_keys(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reads the first configured public key that exists and is non-empty.
    pub fn read_public_key(&self) -> Option<String> {
        let home = dirs::home_dir();
        self.public_keys.iter().find_map(|path| {
            let path = match (&home, path.is_absolute()) {
                (Some(home), false) => home.join(path),
                _ => path.clone(),
            };
            std::fs::read_to_string(&path)
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
        })
    }
}

/// Guest-side layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    /// Mount point of the workspace inside the sandbox.
    #[serde(default = "default_guest_workspace")]
    pub workspace: String,
}

fn default_guest_workspace() -> String {
    "/workspace".to_string()
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            workspace: default_guest_workspace(),
        }
    }
}

/// Timing of every bounded polling loop and external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,
    /// Polls for process-group disappearance after each signal.
    #[serde(default = "default_kill_attempts")]
    pub kill_attempts: u32,
    #[serde(default = "default_kill_interval_ms")]
    pub kill_interval_ms: u64,
    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,
    #[serde(default = "default_port_verify_ms")]
    pub port_verify_timeout_ms: u64,
    #[serde(default = "default_port_verify_interval_ms")]
    pub port_verify_interval_ms: u64,
    #[serde(default = "default_push_attempts")]
    pub push_attempts: u32,
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

fn default_readiness_attempts() -> u32 {
    60
}

fn default_readiness_interval_ms() -> u64 {
    2000
}

fn default_kill_attempts() -> u32 {
    10
}

fn default_kill_interval_ms() -> u64 {
    500
}

fn default_graceful_shutdown_secs() -> u64 {
    30
}

fn default_port_verify_ms() -> u64 {
    5000
}

fn default_port_verify_interval_ms() -> u64 {
    300
}

fn default_push_attempts() -> u32 {
    5
}

fn default_push_interval_ms() -> u64 {
    3000
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_transfer_timeout_secs() -> u64 {
    600
}

fn default_build_timeout_secs() -> u64 {
    3600
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval_ms(),
            kill_attempts: default_kill_attempts(),
            kill_interval_ms: default_kill_interval_ms(),
            graceful_shutdown_secs: default_graceful_shutdown_secs(),
            port_verify_timeout_ms: default_port_verify_ms(),
            port_verify_interval_ms: default_port_verify_interval_ms(),
            push_attempts: default_push_attempts(),
            push_interval_ms: default_push_interval_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

impl TimingConfig {
    pub fn readiness(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.readiness_attempts,
            Duration::from_millis(self.readiness_interval_ms),
        )
    }

    pub fn kill(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.kill_attempts,
            Duration::from_millis(self.kill_interval_ms),
        )
    }

    pub fn port_verify(&self) -> RetryPolicy {
        let interval = Duration::from_millis(self.port_verify_interval_ms);
        let timeout = Duration::from_millis(self.port_verify_timeout_ms);
        let attempts = (self.port_verify_timeout_ms / self.port_verify_interval_ms.max(1)) as u32;
        RetryPolicy::new(attempts.max(1), interval).with_timeout(timeout)
    }

    pub fn push(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.push_attempts,
            Duration::from_millis(self.push_interval_ms),
        )
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// Build collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default = "default_nix_command")]
    pub nix_command: String,
    /// Lines of build output kept in failure diagnostics.
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
}

fn default_nix_command() -> String {
    "nix".to_string()
}

fn default_diagnostic_lines() -> usize {
    40
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            nix_command: default_nix_command(),
            diagnostic_lines: default_diagnostic_lines(),
        }
    }
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_artifact_dirs")]
    pub artifact_dirs: Vec<String>,
}

fn default_artifact_dirs() -> Vec<String> {
    DEFAULT_ARTIFACT_DIRS.iter().map(|d| d.to_string()).collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            artifact_dirs: default_artifact_dirs(),
        }
    }
}

/// Complete configuration, as read from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub defaults: SandboxDefaults,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub guest: GuestConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl AgentConfig {
    /// Loads `config.toml` from the root, or defaults if it does not exist.
    pub fn load(paths: &AgentPaths) -> Result<Self> {
        let path = paths.config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let warnings = config.validate().into_result()?;
        for warning in warnings {
            tracing::warn!(path = %path.display(), "{}", warning);
        }
        Ok(config)
    }

    /// Default resource spec for new sandboxes.
    pub fn default_resources(&self) -> ResourceSpec {
        ResourceSpec::from(&self.defaults.resources)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for ResourceSpec {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.memory_mb < 256 {
            result.add_error("memory_mb must be at least 256");
        } else if self.memory_mb < 1024 {
            result.add_warning("memory_mb below 1024 may not boot a full guest system");
        }

        if self.vcpu_count == 0 {
            result.add_error("vcpu_count must be at least 1");
        }

        let host_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        if self.vcpu_count > host_cpus {
            result.add_warning(format!(
                "vcpu_count {} exceeds the {} CPUs available on this host",
                self.vcpu_count, host_cpus
            ));
        }

        result
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.default_resources().validate();

        if self.ssh.base_port < 1024 {
            result.add_error("ssh.base_port must be an unprivileged port (>= 1024)");
        }

        if self.ssh.user.is_empty() {
            result.add_error("ssh.user cannot be empty");
        }

        if !self.guest.workspace.starts_with('/') {
            result.add_error("guest.workspace must be an absolute path");
        }

        if self.timing.readiness_attempts == 0 {
            result.add_warning("timing.readiness_attempts = 0 skips waiting for the sandbox");
        }

        for dir in &self.sync.artifact_dirs {
            if dir.is_empty() || dir.contains('/') || dir == ".." || dir == "." {
                result.add_error(format!(
                    "sync.artifact_dirs entry '{}' must be a plain directory name",
                    dir
                ));
            }
        }

        result
    }
}
