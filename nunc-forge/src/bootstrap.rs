//! Remote bootstrap of a claimed runner.
//!
//! For every transition into `working` a task is spawned that registers the
//! instance as an ephemeral GitHub runner over SSH, waits for its single job to
//! finish, and then resets the instance to the base image. The outcome of the
//! reset decides whether the runner goes back to `idle` or is marked `dead`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Repository};
use crate::github::RunnerRegistry;
use crate::provider::InstanceProvider;
use crate::runner_state::{Architecture, Runner, RunnerStatus, RunnerStore};
use crate::ssh::RemoteExecutor;

/// Runtime settings for the bootstrap task.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub repository: Repository,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub ssh_grace: Duration,
    /// Covers connect and the whole script run of one attempt
    pub session_timeout: Duration,
    pub runner_version: String,
}

impl BootstrapSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            repository: config.github.repository()?,
            max_attempts: config.bootstrap.max_attempts,
            base_delay: Duration::from_millis(config.bootstrap.base_delay_ms),
            ssh_grace: Duration::from_secs(config.bootstrap.ssh_grace_secs),
            session_timeout: Duration::from_secs(config.ssh.timeout_secs),
            runner_version: config.bootstrap.runner_version.clone(),
        })
    }
}

/// Delay after failed attempt `attempt` (1-based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Shell script that installs, registers and runs an ephemeral runner, then
/// powers the machine off.
pub fn bootstrap_script(
    repository: &Repository,
    token: &str,
    runner_name: &str,
    architecture: Architecture,
    version: &str,
) -> String {
    let asset = format!(
        "actions-runner-linux-{}-{version}.tar.gz",
        architecture.runner_asset_arch()
    );
    format!(
        "mkdir actions-runner && cd actions-runner && \\\n\
         curl -o {asset} -L https://github.com/actions/runner/releases/download/v{version}/{asset} && \\\n\
         tar xzf ./{asset} && \\\n\
         ./config.sh --unattended --url {url} --token {token} --name {runner_name} \
         --no-default-labels --labels self-hosted,{label} --ephemeral --disableupdate && \\\n\
         ./run.sh; sudo poweroff\n",
        url = repository.to_url(),
        label = architecture.label(),
    )
}

/// Drives runners from claimed to finished and reset.
pub struct Bootstrapper {
    store: Arc<RunnerStore>,
    provider: Arc<dyn InstanceProvider>,
    registry: Arc<dyn RunnerRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    settings: BootstrapSettings,
}

impl Bootstrapper {
    pub fn new(
        store: Arc<RunnerStore>,
        provider: Arc<dyn InstanceProvider>,
        registry: Arc<dyn RunnerRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
            executor,
            settings,
        }
    }

    /// Run the bootstrap in the background. Callers do not need to await the
    /// handle; it resolves to the status the runner was released with.
    pub fn spawn(self: &Arc<Self>, runner: Runner) -> JoinHandle<RunnerStatus> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(runner).await })
    }

    /// Bootstrap, reset and release one runner.
    pub async fn run(&self, runner: Runner) -> RunnerStatus {
        self.wait_for_grace(&runner).await;

        let max_attempts = self.settings.max_attempts;
        let mut attempt = 1;
        loop {
            match self.attempt(&runner).await {
                Ok(()) => {
                    info!("Runner {} finished its job", runner.id);
                    break;
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        "Could not start runner {} after {} attempts, giving up: {:#}",
                        runner.id, attempt, e
                    );
                    break;
                }
                Err(e) => {
                    let delay = backoff_delay(self.settings.base_delay, attempt);
                    warn!(
                        "Failed to start runner {} (attempt {}/{}), retrying in {:?}: {:#}",
                        runner.id, attempt, max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }

        self.reset(&runner).await
    }

    async fn wait_for_grace(&self, runner: &Runner) {
        let age = (Utc::now() - runner.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if let Some(remaining) = self.settings.ssh_grace.checked_sub(age)
            && !remaining.is_zero()
        {
            debug!(
                "Runner {} is new, waiting {:?} for sshd",
                runner.id, remaining
            );
            tokio::time::sleep(remaining).await;
        }
    }

    /// One registration attempt: fresh token, new session, run to completion.
    async fn attempt(&self, runner: &Runner) -> Result<()> {
        let addr = runner
            .instance
            .public_ip
            .ok_or_else(|| anyhow!("Instance {} has no public address", runner.instance.name))?;

        let token = self
            .registry
            .registration_token()
            .await
            .context("Failed to get registration token")?;

        let script = bootstrap_script(
            &self.settings.repository,
            &token,
            &runner.id,
            runner.architecture,
            &self.settings.runner_version,
        );

        let session = async {
            let mut session = self.executor.connect(addr).await?;
            info!("Opened session to runner {} ({})", runner.id, addr);
            session.run(&script).await
        };

        let outcome = tokio::time::timeout(self.settings.session_timeout, session)
            .await
            .map_err(|_| anyhow!("Session to {} timed out", runner.id))?
            .with_context(|| format!("SSH session to {} failed", runner.id))?;

        debug!(
            "Session on {} complete: stdout={:?} stderr={:?}",
            runner.id, outcome.stdout, outcome.stderr
        );

        if !outcome.success() {
            bail!(
                "Bootstrap script on {} exited with {:?}: {}",
                runner.id,
                outcome.exit_status,
                outcome.stderr.trim()
            );
        }
        Ok(())
    }

    /// Rebuild the instance and release the runner as idle or dead.
    async fn reset(&self, runner: &Runner) -> RunnerStatus {
        info!("Rebuilding server {}", runner.id);
        let status = match self.provider.rebuild_instance(&runner.instance).await {
            Ok(()) => {
                info!("Server {} rebuilt", runner.id);
                RunnerStatus::Idle
            }
            Err(e) => {
                error!("Could not rebuild server {}: {:#}", runner.id, e);
                RunnerStatus::Dead
            }
        };

        if !self.store.release(&runner.id, status).await {
            debug!("Runner {} was evicted while working", runner.id);
        }
        status
    }
}
