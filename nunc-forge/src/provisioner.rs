//! Provisioning decision for queued jobs.
//!
//! A queued `workflow_job` for a self-hosted architecture label either claims
//! an idle runner of that architecture or creates a new instance. The whole
//! decision, including the provider call, runs under the fleet lock so that two
//! jobs never claim the same runner and ids are never handed out twice.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bootstrap::Bootstrapper;
use crate::config::InstanceSizes;
use crate::provider::InstanceProvider;
use crate::runner_state::{Architecture, Runner, RunnerStore};

/// Label every job for this fleet must request.
pub const SELF_HOSTED_LABEL: &str = "self-hosted";

/// Normalized CI job notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub action: String,
    pub labels: Vec<String>,
}

impl JobEvent {
    pub fn new(action: impl Into<String>, labels: &[&str]) -> Self {
        Self {
            action: action.into(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Architecture this event asks for, if it is one the fleet serves.
    ///
    /// Only `queued` events with `self-hosted` and exactly one architecture
    /// label qualify. Runners carry a single architecture label.
    pub fn requested_architecture(&self) -> Option<Architecture> {
        if self.action != "queued" || !self.has_label(SELF_HOSTED_LABEL) {
            return None;
        }
        match (
            self.has_label(Architecture::Arm64.label()),
            self.has_label(Architecture::Amd64.label()),
        ) {
            (true, false) => Some(Architecture::Arm64),
            (false, true) => Some(Architecture::Amd64),
            _ => None,
        }
    }
}

/// What the engine did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// An idle runner was claimed
    Reused(String),
    /// A new instance was created
    Created(String),
    /// The event does not concern this fleet
    Ignored,
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("No server type configured for {0}")]
    UnknownSize(Architecture),

    #[error("Failed to create instance {name}: {source:#}")]
    CreateInstance {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct Provisioner {
    store: Arc<RunnerStore>,
    provider: Arc<dyn InstanceProvider>,
    bootstrapper: Arc<Bootstrapper>,
    sizes: InstanceSizes,
}

impl Provisioner {
    pub fn new(
        store: Arc<RunnerStore>,
        provider: Arc<dyn InstanceProvider>,
        bootstrapper: Arc<Bootstrapper>,
        sizes: InstanceSizes,
    ) -> Self {
        Self {
            store,
            provider,
            bootstrapper,
            sizes,
        }
    }

    /// Handle one job event. Bootstrap runs in the background.
    pub async fn handle_event(&self, event: &JobEvent) -> Result<ProvisionOutcome, ProvisionError> {
        let Some(architecture) = event.requested_architecture() else {
            debug!(
                "Ignoring job event action={} labels={:?}",
                event.action, event.labels
            );
            return Ok(ProvisionOutcome::Ignored);
        };

        let (outcome, runner) = self.claim_or_create(architecture).await?;
        // Lock released; hand the runner to its own task
        self.bootstrapper.spawn(runner);
        Ok(outcome)
    }

    /// Claim an idle runner or create a new one, all under the fleet lock.
    pub async fn claim_or_create(
        &self,
        architecture: Architecture,
    ) -> Result<(ProvisionOutcome, Runner), ProvisionError> {
        let mut fleet = self.store.lock().await;

        if let Some(runner) = fleet.claim_idle(architecture, Utc::now()) {
            info!("Reusing idle runner {}", runner.id);
            return Ok((ProvisionOutcome::Reused(runner.id.clone()), runner));
        }

        let size = self.sizes.size_for(architecture);
        if size.is_empty() {
            return Err(ProvisionError::UnknownSize(architecture));
        }

        let id = fleet.allocate_id(architecture);
        info!("Creating runner {} ({})", id, size);
        let instance = self
            .provider
            .create_instance(size, &id)
            .await
            .map_err(|source| ProvisionError::CreateInstance {
                name: id.clone(),
                source,
            })?;

        // Grace period counts from when the create call returned
        let runner = Runner::new_working(id.clone(), architecture, instance, Utc::now());
        fleet.insert(runner.clone());
        Ok((ProvisionOutcome::Created(id), runner))
    }
}
