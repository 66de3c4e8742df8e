//! Daemon configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Gateway reachability
    pub gateway: GatewayConfig,

    /// Mesh-wide settings
    pub mesh: MeshConfig,

    /// Certificate validities
    pub pki: PkiConfig,

    /// Reload of the tunnel, resolver and proxy
    pub reload: ReloadConfig,

    /// Docker network integration
    pub docker: DockerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: meshgate_common::default_store_path(),
            gateway: GatewayConfig::default(),
            mesh: MeshConfig::default(),
            pki: PkiConfig::default(),
            reload: ReloadConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

/// Gateway-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Public host name or address other machines use to reach the gateway
    pub public_host: String,

    /// UDP port of the tunnel listener
    pub tunnel_port: u16,

    /// Listen address of the mTLS control endpoint
    pub control_listen: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            public_host: String::new(),
            tunnel_port: 51820,
            control_listen: "0.0.0.0:8443".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Resolver listed first on the gateway and servers
    pub local_resolver: Ipv4Addr,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            local_resolver: Ipv4Addr::LOCALHOST,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    pub root_validity_days: u32,

    /// Validity of the identity minted for each node
    pub identity_validity_days: u32,

    /// Validity of the throwaway identity embedded in a join token
    pub join_validity_days: u32,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            root_validity_days: 3650,
            identity_validity_days: 3650,
            join_validity_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Debounce window for coalesced reloads
    pub delay_secs: u64,

    /// Shell commands run in order on every reload
    pub commands: Vec<String>,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Create the Docker bridge network for a server's subnet after joining
    pub enabled: bool,

    pub network_name: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network_name: "meshgate".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_secs(self.reload.delay_secs)
    }

    /// `host:port` of the tunnel listener, recorded on the gateway row
    pub fn tunnel_endpoint(&self) -> anyhow::Result<String> {
        Ok(format!("{}:{}", self.public_host()?, self.gateway.tunnel_port))
    }

    /// `host:port` a joining machine dials for the control endpoint
    pub fn advertised_control_address(&self) -> anyhow::Result<String> {
        let listen: SocketAddr = self
            .gateway
            .control_listen
            .parse()
            .with_context(|| format!("invalid control_listen {:?}", self.gateway.control_listen))?;
        Ok(format!("{}:{}", self.public_host()?, listen.port()))
    }

    fn public_host(&self) -> anyhow::Result<&str> {
        let host = self.gateway.public_host.trim();
        if host.is_empty() {
            anyhow::bail!("gateway.public_host is not configured");
        }
        Ok(host)
    }
}
