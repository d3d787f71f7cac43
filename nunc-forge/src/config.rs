//! Configuration loading for the fleet controller.
//!
//! Loads configuration from a TOML file and/or environment variables using figment.
//!
//! # Configuration Sources (in order of priority, lowest to highest)
//!
//! 1. Default values (from `#[serde(default)]` attributes)
//! 2. TOML config file (if it exists)
//! 3. Environment variables (prefix: `NUNC_`, nested with `__`)
//!
//! # Environment Variable Naming
//!
//! - `NUNC_HETZNER__TOKEN` → `hetzner.token`
//! - `NUNC_GITHUB__TOKEN` → `github.token`
//! - `NUNC_GITHUB__REPOSITORY` → `github.repository`
//! - `NUNC_GITHUB__WEBHOOK_SECRET` → `github.webhook_secret`
//! - `NUNC_INSTANCES__AMD64` → `instances.amd64`
//! - `NUNC_HTTP__LISTEN_ADDR` → `http.listen_addr`
//!
//! Any error here is fatal: the controller does not start serving with an
//! incomplete configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

use crate::fleet::EvictionPolicy;
use crate::runner_state::Architecture;

/// Main configuration for the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Hetzner Cloud settings
    pub hetzner: HetznerConfig,

    /// GitHub repository and credentials
    pub github: GitHubConfig,

    /// Server type per architecture
    pub instances: InstanceSizes,

    /// SSH access to the instances
    pub ssh: SshAuthConfig,

    /// HTTP listener
    #[serde(default)]
    pub http: HttpConfig,

    /// Eviction policy and loop interval
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Remote bootstrap retry settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Hetzner Cloud settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HetznerConfig {
    /// API token with read/write access to the project
    pub token: String,

    /// Location servers are created in
    #[serde(default = "default_location")]
    pub location: String,

    /// Base image for new servers and for rebuilds
    #[serde(default = "default_image")]
    pub image: String,
}

fn default_location() -> String {
    "nbg1".to_string()
}

fn default_image() -> String {
    "docker-ce".to_string()
}

/// GitHub settings.
///
/// Either `token` (a personal access token with repository administration
/// rights) or `app_id` + `private_key_path` (a GitHub App installed on the
/// repository) must be set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Target repository in `owner/name` form
    pub repository: String,

    /// Personal access token
    #[serde(default)]
    pub token: Option<String>,

    /// GitHub App ID
    #[serde(default)]
    pub app_id: Option<u64>,

    /// Path to the GitHub App private key PEM file
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Secret used to validate `X-Hub-Signature-256`
    pub webhook_secret: String,
}

/// How the controller authenticates against the GitHub API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitHubCredentials {
    Token(String),
    App { app_id: u64, private_key_path: PathBuf },
}

impl GitHubConfig {
    /// Parse `repository` into owner and name.
    pub fn repository(&self) -> Result<Repository> {
        self.repository.parse()
    }

    /// Resolve which credentials to use. A token takes precedence.
    pub fn credentials(&self) -> Result<GitHubCredentials> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(GitHubCredentials::Token(token.clone()));
        }

        match (self.app_id, &self.private_key_path) {
            (Some(app_id), Some(path)) => Ok(GitHubCredentials::App {
                app_id,
                private_key_path: path.clone(),
            }),
            (Some(_), None) => Err(anyhow!("github.app_id is set but github.private_key_path is missing")),
            _ => Err(anyhow!(
                "GitHub credentials missing: set github.token or github.app_id + github.private_key_path"
            )),
        }
    }
}

/// A GitHub repository that runners register against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl std::str::FromStr for Repository {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [owner, name] if !owner.is_empty() && !name.is_empty() => Ok(Repository {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => Err(anyhow!("Malformed repository path: {s} (expected owner/name)")),
        }
    }
}

impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl Repository {
    /// URL passed to `config.sh --url`
    pub fn to_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }

    /// API path for getting a registration token
    pub fn registration_token_path(&self) -> String {
        format!(
            "/repos/{}/{}/actions/runners/registration-token",
            self.owner, self.name
        )
    }

    /// API path for listing runners
    pub fn runners_list_path(&self) -> String {
        format!("/repos/{}/{}/actions/runners", self.owner, self.name)
    }

    /// API path for deleting a specific runner
    pub fn runner_delete_path(&self, runner_id: u64) -> String {
        format!("/repos/{}/{}/actions/runners/{}", self.owner, self.name, runner_id)
    }

    /// API path for looking up the GitHub App installation
    pub fn installation_path(&self) -> String {
        format!("/repos/{}/{}/installation", self.owner, self.name)
    }
}

/// Hetzner server type to use for each architecture.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceSizes {
    /// e.g. `cpx21`
    pub amd64: String,
    /// e.g. `cax21`
    pub arm64: String,
}

impl InstanceSizes {
    pub fn size_for(&self, architecture: Architecture) -> &str {
        match architecture {
            Architecture::Amd64 => &self.amd64,
            Architecture::Arm64 => &self.arm64,
        }
    }
}

/// SSH settings used to bootstrap runners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshAuthConfig {
    /// OpenSSH private key. Its public half is installed through cloud-init.
    pub private_key_path: PathBuf,

    /// Login user created by cloud-init
    #[serde(default = "default_ssh_username")]
    pub username: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Upper bound for one session, including the job it runs
    #[serde(default = "default_ssh_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ssh_username() -> String {
    "gh".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout_secs() -> u64 {
    30 * 60
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path GitHub delivers `workflow_job` events to
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            webhook_path: default_webhook_path(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_webhook_path() -> String {
    "/github-webhook".to_string()
}

/// Reconciliation interval and eviction thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// A working runner older than this is considered stuck
    #[serde(default = "default_stuck_job_minutes")]
    pub stuck_job_minutes: i64,

    /// Provider billing increment
    #[serde(default = "default_billing_period_minutes")]
    pub billing_period_minutes: i64,

    /// Idle runners are removed this close to the next billing boundary
    #[serde(default = "default_idle_eviction_margin_minutes")]
    pub idle_eviction_margin_minutes: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stuck_job_minutes: default_stuck_job_minutes(),
            billing_period_minutes: default_billing_period_minutes(),
            idle_eviction_margin_minutes: default_idle_eviction_margin_minutes(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Eviction thresholds, rejecting negative or out-of-range values.
    pub fn policy(&self) -> Result<EvictionPolicy> {
        let stuck_job_timeout = minutes("reconcile.stuck_job_minutes", self.stuck_job_minutes)?;
        let billing_period = minutes("reconcile.billing_period_minutes", self.billing_period_minutes)?;
        let idle_eviction_margin = minutes(
            "reconcile.idle_eviction_margin_minutes",
            self.idle_eviction_margin_minutes,
        )?;

        if stuck_job_timeout.is_zero() {
            bail!("reconcile.stuck_job_minutes must be positive");
        }
        if billing_period.is_zero() {
            bail!("reconcile.billing_period_minutes must be positive");
        }
        if idle_eviction_margin >= billing_period {
            bail!("reconcile.idle_eviction_margin_minutes must be less than the billing period");
        }

        Ok(EvictionPolicy {
            stuck_job_timeout,
            billing_period,
            idle_eviction_margin,
        })
    }
}

fn minutes(key: &str, value: i64) -> Result<chrono::TimeDelta> {
    if value < 0 {
        bail!("{key} must not be negative");
    }
    chrono::TimeDelta::try_minutes(value).ok_or_else(|| anyhow!("{key} is out of range: {value}"))
}

fn default_interval_secs() -> u64 {
    60
}

fn default_stuck_job_minutes() -> i64 {
    55
}

fn default_billing_period_minutes() -> i64 {
    60
}

fn default_idle_eviction_margin_minutes() -> i64 {
    5
}

/// Remote bootstrap retry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after attempt `n` is `base_delay_ms * 2^n`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Time a new server gets to bring up sshd
    #[serde(default = "default_ssh_grace_secs")]
    pub ssh_grace_secs: u64,

    /// actions/runner release to install
    #[serde(default = "default_runner_version")]
    pub runner_version: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            ssh_grace_secs: default_ssh_grace_secs(),
            runner_version: default_runner_version(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    175
}

fn default_ssh_grace_secs() -> u64 {
    11
}

fn default_runner_version() -> String {
    "2.320.0".to_string()
}

impl Config {
    /// Load configuration from TOML file and environment variables, then validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::new();

        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("NUNC_").split("__"));

        let config: Config = figment
            .extract()
            .with_context(|| format!("Failed to load config from {} and environment", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hetzner.token.is_empty() {
            bail!("hetzner.token is required");
        }
        self.github.repository()?;
        self.github.credentials()?;
        if self.github.webhook_secret.is_empty() {
            bail!("github.webhook_secret is required");
        }
        if self.instances.amd64.is_empty() || self.instances.arm64.is_empty() {
            bail!("instances.amd64 and instances.arm64 are required");
        }
        self.listen_addr()?;
        if !self.http.webhook_path.starts_with('/') {
            bail!("http.webhook_path must start with '/'");
        }
        if self.bootstrap.max_attempts == 0 {
            bail!("bootstrap.max_attempts must be at least 1");
        }
        if self.reconcile.interval_secs == 0 {
            bail!("reconcile.interval_secs must be at least 1");
        }
        self.reconcile.policy()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.http
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.http.listen_addr))
    }

    /// Get the default config file path
    /// - macOS: ~/Library/Application Support/nunc-forge/config.toml
    /// - Linux: ~/.config/nunc-forge/config.toml
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nunc-forge")
            .join("config.toml")
    }
}

/// Create a default configuration template
pub fn default_config_template() -> String {
    r#"# nunc-forge configuration
#
# Every value can also be set through the environment, e.g.
#   NUNC_HETZNER__TOKEN, NUNC_GITHUB__TOKEN, NUNC_GITHUB__WEBHOOK_SECRET

[hetzner]
token = "your-hetzner-api-token"
location = "nbg1"
image = "docker-ce"

[github]
repository = "my-org/my-repo"
webhook_secret = "your-github-webhook-secret"

# Either a personal access token...
token = "ghp_..."
# ...or a GitHub App installed on the repository:
# app_id = 123456
# private_key_path = "/etc/nunc-forge/github-app.pem"

[instances]
amd64 = "cpx21"
arm64 = "cax21"

[ssh]
# Public half is installed on every server through cloud-init
private_key_path = "/etc/nunc-forge/id_ed25519"
# username = "gh"
# timeout_secs = 1800

[http]
listen_addr = "0.0.0.0:8000"
webhook_path = "/github-webhook"

[reconcile]
interval_secs = 60
stuck_job_minutes = 55
billing_period_minutes = 60
idle_eviction_margin_minutes = 5

[bootstrap]
max_attempts = 10
base_delay_ms = 175
ssh_grace_secs = 11
runner_version = "2.320.0"
"#
    .to_string()
}
