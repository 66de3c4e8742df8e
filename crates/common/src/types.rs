//! Core types for meshgate

use crate::pki::{CertificateAuthority, ClientBundle};
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

/// Role of a mesh member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Gateway,
    Server,
    Client,
}

impl NodeRole {
    /// Whether nodes of this role own a Docker subnet
    pub fn has_docker_subnet(self) -> bool {
        matches!(self, NodeRole::Gateway | NodeRole::Server)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Gateway => "gateway",
            NodeRole::Server => "server",
            NodeRole::Client => "client",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gateway" => Ok(NodeRole::Gateway),
            "server" => Ok(NodeRole::Server),
            "client" => Ok(NodeRole::Client),
            other => Err(Error::RoleUnsupported(other.to_string())),
        }
    }
}

/// Tunnel peer entry derived by the topology recompute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub node_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<Ipv4Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

/// A mesh member
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub role: NodeRole,
    pub private_address: Ipv4Addr,
    pub public_key: String,
    pub private_key: String,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_subnet: Option<Ipv4Network>,
    pub identity: ClientBundle,
    /// Present only on the gateway's own row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CertificateAuthority>,
    /// Externally reachable `host:port` of the gateway's tunnel listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub is_current: bool,
    pub created_at: i64,
}

impl Node {
    /// Copy of this node with the certificate authority stripped, safe to
    /// hand to another machine.
    pub fn without_ca(&self) -> Node {
        Node {
            ca: None,
            ..self.clone()
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.role == NodeRole::Gateway
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("private_address", &self.private_address)
            .field("public_key", &self.public_key)
            .field("docker_subnet", &self.docker_subnet)
            .field("peers", &self.peers.len())
            .field("dns", &self.dns)
            .field("endpoint", &self.endpoint)
            .field("has_ca", &self.ca.is_some())
            .field("is_current", &self.is_current)
            .finish()
    }
}

/// An outstanding invitation to join the mesh.
///
/// The canonical token is the JSON encoding of this struct in field order,
/// base64 encoded with the standard alphabet. It carries the throwaway
/// private key and is therefore a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJoinRequest {
    pub id: String,
    pub role: NodeRole,
    pub gateway_address: String,
    pub ephemeral_identity: ClientBundle,
    pub forced_docker_subnet: Option<Ipv4Network>,
}

impl PendingJoinRequest {
    pub fn to_token(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    pub fn from_token(token: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| Error::InvalidToken(format!("not base64: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidToken(format!("not a join request: {}", e)))
    }
}

/// Short SHA-256 fingerprint of a token, the only form of it that is logged.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}
