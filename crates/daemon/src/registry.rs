//! Node registry
//!
//! Owns node rows and the role rules. Every creation runs as one IMMEDIATE
//! transaction: snapshot the node set, allocate, mint the identity on the
//! gateway's CA, insert, recompute the whole topology and write it back.

use chrono::Utc;
use ipnetwork::Ipv4Network;
use meshgate_common::{
    allocator,
    db::{nodes, pending},
    topology, CertificateAuthority, Database, Error, Node, NodeRole, Result, WireGuardKeyPair,
};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info};
use uuid::Uuid;

/// Settings for bootstrapping the gateway
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Names covered by the control endpoint's server certificate
    pub server_names: Vec<String>,
    /// Public `host:port` of the tunnel listener
    pub endpoint: String,
    pub root_validity_days: u32,
}

#[derive(Clone)]
pub struct NodeRegistry {
    db: Database,
    local_resolver: Ipv4Addr,
    identity_validity_days: u32,
}

impl NodeRegistry {
    pub fn new(db: Database, local_resolver: Ipv4Addr, identity_validity_days: u32) -> Self {
        Self {
            db,
            local_resolver,
            identity_validity_days,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create the hub. Its row holds the CA and is marked current.
    pub fn create_gateway(&self, settings: &GatewaySettings) -> Result<Node> {
        self.db.with_transaction(|conn| {
            let mut arena = nodes::load_all(conn)?;
            if let Some(existing) = arena.values().find(|n| n.is_gateway()) {
                return Err(Error::AlreadyExists {
                    kind: "gateway".into(),
                    id: existing.id.clone(),
                });
            }

            let private_address = allocator::allocate_address(arena.values())?;
            let docker_subnet = allocator::allocate_subnet(arena.values(), None)?;

            let id = Uuid::new_v4().to_string();
            let mut ca =
                CertificateAuthority::generate(&settings.server_names, settings.root_validity_days)?;
            let identity = ca.add_client(&id, self.identity_validity_days)?;
            let keys = WireGuardKeyPair::generate();

            let node = Node {
                id: id.clone(),
                role: NodeRole::Gateway,
                private_address,
                public_key: keys.public_key,
                private_key: keys.private_key,
                peers: Vec::new(),
                dns: Vec::new(),
                docker_subnet: Some(docker_subnet),
                identity,
                ca: Some(ca),
                endpoint: Some(settings.endpoint.clone()),
                is_current: true,
                created_at: Utc::now().timestamp(),
            };

            nodes::clear_current_except(conn, &id)?;
            nodes::insert(conn, &node)?;
            arena.insert(id.clone(), node);
            self.write_topology(conn, &mut arena, &[])?;

            info!(
                node_id = %id,
                address = %private_address,
                subnet = %docker_subnet,
                "Created gateway node"
            );
            arena
                .remove(&id)
                .ok_or_else(|| Error::Internal("gateway vanished from snapshot".into()))
        })
    }

    pub fn create_server(&self, forced_subnet: Option<Ipv4Network>) -> Result<Node> {
        self.db
            .with_transaction(|conn| self.create_spoke_in(conn, NodeRole::Server, forced_subnet))
    }

    pub fn create_client(&self) -> Result<Node> {
        self.db
            .with_transaction(|conn| self.create_spoke_in(conn, NodeRole::Client, None))
    }

    /// Create a server or client inside the caller's transaction.
    ///
    /// The persistent identity is added to the gateway's CA and the gateway
    /// row is rewritten in the same transaction.
    pub(crate) fn create_spoke_in(
        &self,
        conn: &Connection,
        role: NodeRole,
        forced_subnet: Option<Ipv4Network>,
    ) -> Result<Node> {
        if role == NodeRole::Gateway {
            return Err(Error::RoleUnsupported(role.to_string()));
        }
        if forced_subnet.is_some() && role != NodeRole::Server {
            return Err(Error::RoleUnsupported(format!(
                "{} with a forced docker subnet",
                role
            )));
        }

        let mut arena = nodes::load_all(conn)?;
        let mut gateway = arena
            .values()
            .find(|n| n.is_gateway())
            .cloned()
            .ok_or(Error::NoGateway)?;

        let private_address = allocator::allocate_address(arena.values())?;
        let docker_subnet = if role.has_docker_subnet() {
            Some(allocator::allocate_subnet(arena.values(), forced_subnet)?)
        } else {
            None
        };

        let id = Uuid::new_v4().to_string();
        let identity = gateway
            .ca
            .as_mut()
            .ok_or_else(|| Error::Internal("gateway row carries no certificate authority".into()))?
            .add_client(&id, self.identity_validity_days)?;
        let keys = WireGuardKeyPair::generate();

        let node = Node {
            id: id.clone(),
            role,
            private_address,
            public_key: keys.public_key,
            private_key: keys.private_key,
            peers: Vec::new(),
            dns: Vec::new(),
            docker_subnet,
            identity,
            ca: None,
            endpoint: None,
            is_current: false,
            created_at: Utc::now().timestamp(),
        };

        nodes::insert(conn, &node)?;
        let gateway_id = gateway.id.clone();
        arena.insert(gateway_id.clone(), gateway);
        arena.insert(id.clone(), node);
        self.write_topology(conn, &mut arena, &[gateway_id])?;

        info!(
            node_id = %id,
            role = %role,
            address = %private_address,
            subnet = ?docker_subnet,
            "Created mesh node"
        );
        arena
            .remove(&id)
            .ok_or_else(|| Error::Internal("node vanished from snapshot".into()))
    }

    /// Recompute projections over `arena` and persist every row whose derived
    /// fields changed, plus the `dirty` rows the caller mutated.
    fn write_topology(
        &self,
        conn: &Connection,
        arena: &mut BTreeMap<String, Node>,
        dirty: &[String],
    ) -> Result<usize> {
        let mut changed = topology::apply(arena, self.local_resolver);
        for id in dirty {
            if !changed.contains(id) {
                changed.push(id.clone());
            }
        }

        for id in &changed {
            if let Some(node) = arena.get(id) {
                nodes::upsert(conn, node)?;
            }
        }
        debug!(rows = changed.len(), "Wrote topology");
        Ok(changed.len())
    }

    /// Recompute the topology over every stored row. Returns the number of
    /// rows rewritten.
    pub fn recompute_topology(&self) -> Result<usize> {
        self.db.with_transaction(|conn| {
            let mut arena = nodes::load_all(conn)?;
            self.write_topology(conn, &mut arena, &[])
        })
    }

    /// This machine's own node
    pub fn get_current(&self) -> Result<Node> {
        self.db
            .read(|conn| nodes::get_current(conn))?
            .ok_or_else(|| Error::not_found("node", "current"))
    }

    pub fn get_gateway(&self) -> Result<Node> {
        self.db
            .read(|conn| nodes::get_gateway(conn))?
            .ok_or(Error::NoGateway)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Node> {
        self.db
            .read(|conn| nodes::get(conn, id))?
            .ok_or_else(|| Error::not_found("node", id))
    }

    /// All nodes ordered by creation time
    pub fn list(&self) -> Result<Vec<Node>> {
        let mut all: Vec<Node> = self
            .db
            .read(|conn| nodes::load_all(conn))?
            .into_values()
            .collect();
        all.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(all)
    }

    /// Insert or replace a node as given, e.g. the record a spoke received
    /// from the gateway. Marking it current clears the marker elsewhere.
    pub fn save_node(&self, node: &Node) -> Result<()> {
        self.db.with_transaction(|conn| {
            if node.is_current {
                nodes::clear_current_except(conn, &node.id)?;
            }
            nodes::upsert(conn, node)
        })?;
        debug!(node_id = %node.id, "Saved node");
        Ok(())
    }

    /// Make `node`, just returned by a gateway, the only row in this store.
    ///
    /// Rows left from an earlier mesh would otherwise clash on the unique
    /// address and subnet columns.
    pub fn replace_with_joined(&self, node: &Node) -> Result<()> {
        let mut node = node.clone();
        node.is_current = true;
        let removed = self.db.with_transaction(|conn| {
            let removed = nodes::delete_all(conn)?;
            nodes::insert(conn, &node)?;
            Ok(removed)
        })?;
        info!(node_id = %node.id, replaced = removed, "Stored joined node");
        Ok(())
    }

    /// Remove every node and pending join request
    pub fn delete_all(&self) -> Result<()> {
        let (removed_nodes, removed_pending) = self.db.with_transaction(|conn| {
            Ok((nodes::delete_all(conn)?, pending::delete_all(conn)?))
        })?;
        info!(
            nodes = removed_nodes,
            pending = removed_pending,
            "Deleted all mesh state"
        );
        Ok(())
    }
}
