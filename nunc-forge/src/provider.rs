//! Cloud provider abstraction and the Hetzner Cloud implementation.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nunc_hcloud_api::{CreateServerRequest, HetznerCloudAPI, PublicNetRequest, Server};
use tracing::{debug, info};

use crate::config::HetznerConfig;

/// How long to wait for a rebuild action before treating it as failed.
const REBUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Handle to a cloud instance. Only the name and address matter to the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Provider-side identifier
    pub id: u64,
    /// Instance name, equal to the runner id for managed instances
    pub name: String,
    /// Address reachable over SSH
    pub public_ip: Option<IpAddr>,
}

impl From<Server> for Instance {
    fn from(server: Server) -> Self {
        Self {
            public_ip: server.public_ipv4().map(IpAddr::V4),
            id: server.id,
            name: server.name,
        }
    }
}

/// Operations the fleet needs from the cloud provider.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// List every instance in the project.
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Create and start an instance of the given size.
    async fn create_instance(&self, size: &str, name: &str) -> Result<Instance>;

    /// Delete an instance.
    async fn delete_instance(&self, instance: &Instance) -> Result<()>;

    /// Reset an instance to its base image.
    async fn rebuild_instance(&self, instance: &Instance) -> Result<()>;
}

/// Cloud-init payload that authorizes the controller's key for user `gh`.
pub fn cloud_init(public_key: &str) -> String {
    format!(
        r#"#cloud-config
users:
  - name: gh
    groups: docker
    sudo: ALL=(ALL) NOPASSWD:ALL
    ssh_authorized_keys:
      - "{public_key}"
"#
    )
}

/// Hetzner Cloud backed provider.
pub struct HetznerProvider {
    api: HetznerCloudAPI,
    image: String,
    location: String,
    user_data: String,
}

impl HetznerProvider {
    pub fn new(config: &HetznerConfig, public_key: &str) -> Result<Self> {
        let api = HetznerCloudAPI::new(&config.token).context("Failed to create Hetzner client")?;
        Ok(Self {
            api,
            image: config.image.clone(),
            location: config.location.clone(),
            user_data: cloud_init(public_key),
        })
    }
}

#[async_trait]
impl InstanceProvider for HetznerProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let servers = self
            .api
            .list_servers()
            .await
            .context("Failed to list Hetzner servers")?;
        Ok(servers.into_iter().map(Instance::from).collect())
    }

    async fn create_instance(&self, size: &str, name: &str) -> Result<Instance> {
        info!("Creating Hetzner server {} ({}, {})", name, size, self.location);

        let request = CreateServerRequest {
            name: name.to_string(),
            server_type: size.to_string(),
            image: self.image.clone(),
            location: Some(self.location.clone()),
            start_after_create: true,
            public_net: PublicNetRequest {
                enable_ipv4: true,
                enable_ipv6: false,
            },
            user_data: Some(self.user_data.clone()),
        };

        let server = self
            .api
            .create_server(&request)
            .await
            .with_context(|| format!("Failed to create Hetzner server {name}"))?;
        Ok(Instance::from(server))
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        self.api
            .delete_server(instance.id)
            .await
            .with_context(|| format!("Failed to delete Hetzner server {}", instance.name))?;
        Ok(())
    }

    async fn rebuild_instance(&self, instance: &Instance) -> Result<()> {
        let action = self
            .api
            .rebuild_server(instance.id, &self.image)
            .await
            .with_context(|| format!("Failed to rebuild Hetzner server {}", instance.name))?;

        debug!("Waiting for rebuild of {} (action {})", instance.name, action.id);
        self.api
            .wait_for_action(&action, REBUILD_TIMEOUT)
            .await
            .with_context(|| format!("Rebuild of Hetzner server {} did not finish", instance.name))?;
        Ok(())
    }
}
