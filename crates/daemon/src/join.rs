//! Join-request protocol
//!
//! The gateway issues a bearer token carrying a throwaway client identity.
//! The new machine presents that identity over mutual TLS and posts the
//! token back; the gateway finds the pending request by the certificate's
//! Common Name, requires the token to match the stored request byte for
//! byte, creates the node and consumes the request in one transaction.

use crate::registry::NodeRegistry;
use crate::reload::{DockerNetwork, ReloadRunner, ReloadTrigger};
use ipnetwork::Ipv4Network;
use meshgate_common::{
    allocator,
    db::{nodes, pending},
    token_fingerprint, Capacity, Error, Exhausted, Node, NodeRole, PendingJoinRequest, Result,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Body of `POST /commands/join`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCommand {
    pub join_token: String,
}

/// Successful reply to a join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReply {
    pub node: Node,
}

/// Who is redeeming, as established by the TLS layer
#[derive(Debug, Clone)]
pub struct Caller {
    /// Common Name of the verified client certificate
    pub common_name: String,
    pub remote_addr: Option<SocketAddr>,
}

pub struct JoinService {
    registry: NodeRegistry,
    trigger: ReloadTrigger,
    gateway_address: String,
    join_validity_days: u32,
}

impl JoinService {
    pub fn new(
        registry: NodeRegistry,
        trigger: ReloadTrigger,
        gateway_address: impl Into<String>,
        join_validity_days: u32,
    ) -> Self {
        Self {
            registry,
            trigger,
            gateway_address: gateway_address.into(),
            join_validity_days,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Mint a one-shot join token for a new server or client.
    pub fn issue_join_token(
        &self,
        role: NodeRole,
        forced_subnet: Option<Ipv4Network>,
    ) -> Result<String> {
        if role == NodeRole::Gateway {
            return Err(Error::RoleUnsupported(role.to_string()));
        }
        if forced_subnet.is_some() && role != NodeRole::Server {
            return Err(Error::RoleUnsupported(format!(
                "{} with a forced docker subnet",
                role
            )));
        }

        let token = self.registry.database().with_transaction(|conn| {
            let mut gateway = nodes::get_gateway(conn)?.ok_or(Error::NoGateway)?;
            let members: Vec<Node> = nodes::load_all(conn)?.into_values().collect();
            let outstanding = pending::list(conn)?;

            if forced_subnet.is_some() {
                let subnet = allocator::allocate_subnet(&members, forced_subnet)?;
                let reserved = outstanding
                    .iter()
                    .filter_map(|r| r.forced_docker_subnet)
                    .any(|s| s.network() == subnet.network() && s.prefix() == subnet.prefix());
                if reserved {
                    return Err(Error::SubnetInUse(subnet.to_string()));
                }
            }
            let capacity = Capacity::advisory(&members, &outstanding);
            if !capacity.admits(role) {
                let exhausted = if capacity.free_addresses == 0 {
                    Exhausted::NoAddressAvailable
                } else {
                    Exhausted::NoSubnetAvailable
                };
                return Err(Error::ResourceExhausted(exhausted));
            }

            let id = Uuid::new_v4().to_string();
            let ephemeral_identity = gateway
                .ca
                .as_mut()
                .ok_or_else(|| Error::Internal("gateway row carries no certificate authority".into()))?
                .add_client(&id, self.join_validity_days)?;

            let request = PendingJoinRequest {
                id,
                role,
                gateway_address: self.gateway_address.clone(),
                ephemeral_identity,
                forced_docker_subnet: forced_subnet,
            };
            pending::insert(conn, &request)?;
            nodes::upsert(conn, &gateway)?;

            let token = request.to_token()?;
            info!(
                request_id = %request.id,
                role = %role,
                fingerprint = %token_fingerprint(&token),
                "Issued join token"
            );
            Ok(token)
        })?;

        Ok(token)
    }

    /// Consume a join token presented by `caller` and create its node.
    ///
    /// Servers are reloaded through the scheduler; clients reload before
    /// this returns.
    pub async fn redeem_join_token(&self, token: &str, caller: &Caller) -> Result<Node> {
        let fingerprint = token_fingerprint(token);

        let (node, role) = self.registry.database().with_transaction(|conn| {
            let stored = pending::get(conn, &caller.common_name)?
                .ok_or_else(|| Error::not_found("join request", caller.common_name.as_str()))?;

            if stored.to_token()?.as_bytes() != token.as_bytes() {
                warn!(
                    request_id = %stored.id,
                    fingerprint = %fingerprint,
                    remote = ?caller.remote_addr,
                    "Security: join token does not match the stored request"
                );
                return Err(Error::Tampered);
            }

            let node = match stored.role {
                NodeRole::Server => self.registry.create_spoke_in(
                    conn,
                    NodeRole::Server,
                    stored.forced_docker_subnet,
                )?,
                NodeRole::Client => self.registry.create_spoke_in(conn, NodeRole::Client, None)?,
                other => return Err(Error::RoleUnsupported(other.to_string())),
            };

            let mut gateway = nodes::get_gateway(conn)?.ok_or(Error::NoGateway)?;
            if let Some(ca) = gateway.ca.as_mut() {
                ca.remove_client(&stored.id);
            }
            nodes::upsert(conn, &gateway)?;
            pending::delete(conn, &stored.id)?;

            Ok((node, stored.role))
        })?;

        info!(
            request_id = %caller.common_name,
            node_id = %node.id,
            role = %role,
            fingerprint = %fingerprint,
            "Join request redeemed"
        );

        self.trigger.trigger(role == NodeRole::Client).await;
        Ok(node.without_ca())
    }

    pub fn list_pending(&self) -> Result<Vec<PendingJoinRequest>> {
        self.registry.database().read(|conn| pending::list(conn))
    }

    /// Drop an outstanding request and revoke its throwaway identity
    pub fn cancel(&self, id: &str) -> Result<()> {
        self.registry.database().with_transaction(|conn| {
            if !pending::delete(conn, id)? {
                return Err(Error::not_found("join request", id));
            }
            if let Some(mut gateway) = nodes::get_gateway(conn)? {
                if let Some(ca) = gateway.ca.as_mut() {
                    ca.remove_client(id);
                }
                nodes::upsert(conn, &gateway)?;
            }
            Ok(())
        })?;
        info!(request_id = %id, "Cancelled join request");
        Ok(())
    }
}

/// Post `token` to the gateway named inside it and return the node it creates.
pub async fn redeem_remote(token: &str) -> Result<Node> {
    let request = PendingJoinRequest::from_token(token)?;
    let tls = request.ephemeral_identity.client_tls_config()?;

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::NetworkError(e.to_string()))?;

    let url = format!("https://{}/commands/join", request.gateway_address);
    info!(
        gateway = %request.gateway_address,
        fingerprint = %token_fingerprint(token),
        "Redeeming join token"
    );

    let response = client
        .post(&url)
        .json(&JoinCommand {
            join_token: token.to_string(),
        })
        .send()
        .await
        .map_err(|e| Error::NetworkError(format!("{}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::NetworkError(format!(
            "gateway refused join ({}): {}",
            status, body
        )));
    }

    let reply: JoinReply = response
        .json()
        .await
        .map_err(|e| Error::NetworkError(format!("malformed join reply: {}", e)))?;
    Ok(reply.node)
}

/// Full redeemer-side flow: join, store the node as this machine's own,
/// prepare its Docker network and reload local services.
///
/// Refuses before contacting the gateway when this store already holds
/// nodes, since a redeemed token cannot be redeemed again.
pub async fn join_mesh(
    registry: &NodeRegistry,
    docker: &dyn DockerNetwork,
    runner: &ReloadRunner,
    token: &str,
) -> Result<Node> {
    if let Some(existing) = registry.list()?.into_iter().next() {
        warn!(node_id = %existing.id, "Local store already holds mesh state; run reset first");
        return Err(Error::AlreadyExists {
            kind: "local node".into(),
            id: existing.id,
        });
    }

    let mut node = redeem_remote(token).await?;
    node.is_current = true;
    registry.replace_with_joined(&node)?;
    info!(node_id = %node.id, role = %node.role, address = %node.private_address, "Joined mesh");

    if let Some(subnet) = node.docker_subnet {
        if let Err(e) = docker.ensure(subnet).await {
            warn!(error = %e, subnet = %subnet, "Failed to prepare Docker network");
        }
    }
    if let Err(e) = runner.run_exclusive().await {
        warn!(error = %e, "Reload after join failed");
    }
    Ok(node)
}
