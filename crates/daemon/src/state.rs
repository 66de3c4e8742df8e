//! Wiring of the daemon's components from configuration

use crate::config::DaemonConfig;
use crate::join::JoinService;
use crate::registry::{GatewaySettings, NodeRegistry};
use crate::reload::{
    CommandReloader, DockerCli, DockerDisabled, DockerNetwork, ReloadRunner, ReloadTrigger,
    Reloader,
};
use anyhow::Context;
use meshgate_common::{Database, Node};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a subcommand needs, built once from the configuration
#[derive(Clone)]
pub struct ControlPlane {
    config: DaemonConfig,
    registry: NodeRegistry,
    runner: Arc<ReloadRunner>,
    docker: Arc<dyn DockerNetwork>,
}

impl ControlPlane {
    /// Open the on-disk store and build the configured collaborators
    pub fn open(config: &DaemonConfig) -> anyhow::Result<Self> {
        let db = Database::open(config.db_path())
            .with_context(|| format!("opening {}", config.db_path().display()))?;
        let reloader: Arc<dyn Reloader> =
            Arc::new(CommandReloader::new(config.reload.commands.clone()));
        let docker: Arc<dyn DockerNetwork> = if config.docker.enabled {
            Arc::new(DockerCli::new(config.docker.network_name.clone()))
        } else {
            Arc::new(DockerDisabled)
        };
        Ok(Self::with_parts(config.clone(), db, reloader, docker))
    }

    pub fn with_parts(
        config: DaemonConfig,
        db: Database,
        reloader: Arc<dyn Reloader>,
        docker: Arc<dyn DockerNetwork>,
    ) -> Self {
        let registry = NodeRegistry::new(
            db,
            config.mesh.local_resolver,
            config.pki.identity_validity_days,
        );
        Self {
            config,
            registry,
            runner: ReloadRunner::new(reloader),
            docker,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<ReloadRunner> {
        &self.runner
    }

    pub fn docker(&self) -> &dyn DockerNetwork {
        self.docker.as_ref()
    }

    /// Create this machine's gateway node from the configured public host
    /// and prepare the Docker network for its subnet.
    ///
    /// `extra_names` are added to the control endpoint certificate. A Docker
    /// failure is logged; the committed gateway row stays.
    pub async fn init_gateway(&self, extra_names: &[String]) -> anyhow::Result<Node> {
        let endpoint = self.config.tunnel_endpoint()?;
        let mut server_names = vec![self.config.gateway.public_host.trim().to_string()];
        for name in extra_names {
            if !server_names.contains(name) {
                server_names.push(name.clone());
            }
        }

        let node = self.registry.create_gateway(&GatewaySettings {
            server_names,
            endpoint,
            root_validity_days: self.config.pki.root_validity_days,
        })?;
        info!(node_id = %node.id, "Gateway initialized");

        if let Some(subnet) = node.docker_subnet {
            if let Err(e) = self.docker.ensure(subnet).await {
                warn!(error = %e, subnet = %subnet, "Failed to prepare Docker network");
            }
        }
        Ok(node)
    }

    /// Join service with a running reload scheduler. Must be called inside a
    /// tokio runtime.
    pub fn join_service(&self) -> anyhow::Result<JoinService> {
        let trigger = ReloadTrigger::spawn(self.runner.clone(), self.config.reload_delay());
        Ok(JoinService::new(
            self.registry.clone(),
            trigger,
            self.config.advertised_control_address()?,
            self.config.pki.join_validity_days,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::tests::{RecordingDocker, RecordingReloader};
    use meshgate_common::NodeRole;
    use std::time::Duration;

    fn plane_with_docker(public_host: &str, docker: Arc<RecordingDocker>) -> ControlPlane {
        let mut config = DaemonConfig::default();
        config.gateway.public_host = public_host.to_string();
        ControlPlane::with_parts(
            config,
            Database::open_memory().unwrap(),
            RecordingReloader::with_duration(Duration::ZERO),
            docker,
        )
    }

    fn plane(public_host: &str) -> ControlPlane {
        plane_with_docker(public_host, Arc::new(RecordingDocker::default()))
    }

    #[tokio::test]
    async fn test_init_gateway_requires_public_host() {
        let docker = Arc::new(RecordingDocker::default());
        let plane = plane_with_docker("", docker.clone());
        assert!(plane.init_gateway(&[]).await.is_err());
        assert!(plane.registry().list().unwrap().is_empty());
        assert!(docker.ensured().is_empty());
    }

    #[tokio::test]
    async fn test_init_gateway_uses_config() {
        let plane = plane("gw.example.net");
        let node = plane
            .init_gateway(&["127.0.0.1".to_string(), "gw.example.net".to_string()])
            .await
            .unwrap();
        assert_eq!(node.endpoint.as_deref(), Some("gw.example.net:51820"));
        assert_eq!(
            node.ca.unwrap().server_names(),
            &["gw.example.net".to_string(), "127.0.0.1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_init_gateway_prepares_docker_network() {
        let docker = Arc::new(RecordingDocker::default());
        let plane = plane_with_docker("gw.example.net", docker.clone());
        let node = plane.init_gateway(&[]).await.unwrap();

        let subnet: ipnetwork::Ipv4Network = "172.19.0.0/16".parse().unwrap();
        assert_eq!(node.docker_subnet, Some(subnet));
        assert_eq!(docker.ensured(), vec![subnet]);
    }

    #[tokio::test]
    async fn test_init_gateway_survives_docker_failure() {
        let docker = RecordingDocker::failing();
        let plane = plane_with_docker("gw.example.net", docker.clone());
        let node = plane.init_gateway(&[]).await.unwrap();

        assert_eq!(docker.ensured().len(), 1);
        assert_eq!(plane.registry().get_gateway().unwrap().id, node.id);
    }

    #[tokio::test]
    async fn test_join_service_advertises_control_address() {
        let plane = plane("gw.example.net");
        plane.init_gateway(&[]).await.unwrap();

        let token = plane
            .join_service()
            .unwrap()
            .issue_join_token(NodeRole::Client, None)
            .unwrap();
        let request = meshgate_common::PendingJoinRequest::from_token(&token).unwrap();
        assert_eq!(request.gateway_address, "gw.example.net:8443");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.store_path = dir.path().to_path_buf();
        config.docker.enabled = false;

        let plane = ControlPlane::open(&config).unwrap();
        assert!(plane.registry().list().unwrap().is_empty());
        assert!(config.db_path().exists());
    }
}
