//! Hub-and-spoke topology
//!
//! `compute` derives every node's peers and resolver list from a read-only
//! snapshot of the whole node set; `apply` writes those projections back.

use crate::allocator::{docker_range, host_network, mesh_network};
use crate::{Node, NodeRole, Peer};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Keepalive spokes send towards the gateway
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 15;

/// Derived fields of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub peers: Vec<Peer>,
    pub dns: Vec<Ipv4Addr>,
}

/// Nodes ordered by creation time, then id
fn ordered(nodes: &BTreeMap<String, Node>) -> Vec<&Node> {
    let mut ordered: Vec<&Node> = nodes.values().collect();
    ordered.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    ordered
}

fn gateway_projection(spokes: &[&Node], local_resolver: Ipv4Addr) -> Projection {
    let mut dns = vec![local_resolver];
    dns.extend(
        spokes
            .iter()
            .filter(|n| n.role == NodeRole::Server)
            .map(|n| n.private_address),
    );

    let peers = spokes
        .iter()
        .map(|n| {
            let mut allowed_ips = vec![host_network(n.private_address)];
            if n.role == NodeRole::Server {
                allowed_ips.extend(n.docker_subnet);
            }
            Peer {
                node_id: n.id.clone(),
                public_key: n.public_key.clone(),
                endpoint: None,
                allowed_ips,
                persistent_keepalive: None,
            }
        })
        .collect();

    Projection { peers, dns }
}

fn spoke_projection(spoke: &Node, gateway: &Node, local_resolver: Ipv4Addr) -> Projection {
    let (allowed_ips, dns) = match spoke.role {
        NodeRole::Server => (
            vec![mesh_network()],
            vec![gateway.private_address, local_resolver],
        ),
        _ => (
            vec![docker_range(), mesh_network()],
            vec![gateway.private_address],
        ),
    };

    Projection {
        peers: vec![Peer {
            node_id: gateway.id.clone(),
            public_key: gateway.public_key.clone(),
            endpoint: gateway.endpoint.clone(),
            allowed_ips,
            persistent_keepalive: Some(PERSISTENT_KEEPALIVE_SECS),
        }],
        dns,
    }
}

/// Compute the projection of every node in `nodes`.
///
/// Without a gateway every spoke gets empty peers and resolvers.
pub fn compute(
    nodes: &BTreeMap<String, Node>,
    local_resolver: Ipv4Addr,
) -> BTreeMap<String, Projection> {
    let ordered = ordered(nodes);
    let gateway = ordered.iter().copied().find(|n| n.role == NodeRole::Gateway);
    let spokes: Vec<&Node> = ordered
        .iter()
        .copied()
        .filter(|n| n.role != NodeRole::Gateway)
        .collect();

    ordered
        .iter()
        .map(|node| {
            let projection = match (node.role, gateway) {
                (NodeRole::Gateway, _) => gateway_projection(&spokes, local_resolver),
                (_, Some(gw)) => spoke_projection(node, gw, local_resolver),
                (_, None) => Projection::default(),
            };
            (node.id.clone(), projection)
        })
        .collect()
}

/// Recompute and store the projections. Returns the ids whose derived
/// fields changed.
pub fn apply(nodes: &mut BTreeMap<String, Node>, local_resolver: Ipv4Addr) -> Vec<String> {
    let projections = compute(nodes, local_resolver);
    let mut changed = Vec::new();

    for (id, projection) in projections {
        if let Some(node) = nodes.get_mut(&id) {
            if node.peers != projection.peers || node.dns != projection.dns {
                node.peers = projection.peers;
                node.dns = projection.dns;
                changed.push(id);
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node_fixture;

    const RESOLVER: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn arena(nodes: Vec<Node>) -> BTreeMap<String, Node> {
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect()
    }

    fn sample_mesh() -> BTreeMap<String, Node> {
        arena(vec![
            node_fixture("gw", NodeRole::Gateway, 1, Some(19)),
            node_fixture("srv", NodeRole::Server, 2, Some(20)),
            node_fixture("cli", NodeRole::Client, 3, None),
        ])
    }

    #[test]
    fn test_lone_gateway_has_no_peers() {
        let nodes = arena(vec![node_fixture("gw", NodeRole::Gateway, 1, Some(19))]);
        let projections = compute(&nodes, RESOLVER);
        assert!(projections["gw"].peers.is_empty());
        assert_eq!(projections["gw"].dns, vec![RESOLVER]);
    }

    #[test]
    fn test_gateway_peers_every_spoke() {
        let projections = compute(&sample_mesh(), RESOLVER);
        let gw = &projections["gw"];

        assert_eq!(gw.dns, vec![RESOLVER, Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(gw.peers.len(), 2);

        let srv = &gw.peers[0];
        assert_eq!(srv.node_id, "srv");
        assert_eq!(srv.public_key, "pub-srv");
        let allowed: Vec<String> = srv.allowed_ips.iter().map(|n| n.to_string()).collect();
        assert_eq!(allowed, vec!["10.0.0.2/32", "172.20.0.0/16"]);
        assert!(srv.endpoint.is_none());

        let cli = &gw.peers[1];
        let allowed: Vec<String> = cli.allowed_ips.iter().map(|n| n.to_string()).collect();
        assert_eq!(allowed, vec!["10.0.0.3/32"]);
    }

    #[test]
    fn test_spokes_peer_only_the_gateway() {
        let projections = compute(&sample_mesh(), RESOLVER);

        let srv = &projections["srv"];
        assert_eq!(srv.dns, vec![Ipv4Addr::new(10, 0, 0, 1), RESOLVER]);
        assert_eq!(srv.peers.len(), 1);
        assert_eq!(srv.peers[0].node_id, "gw");
        assert_eq!(srv.peers[0].endpoint.as_deref(), Some("gw.example.net:51820"));
        assert_eq!(srv.peers[0].persistent_keepalive, Some(15));
        assert_eq!(srv.peers[0].allowed_ips, vec![mesh_network()]);

        let cli = &projections["cli"];
        assert_eq!(cli.dns, vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(cli.peers[0].allowed_ips, vec![docker_range(), mesh_network()]);
    }

    #[test]
    fn test_no_gateway_leaves_spokes_empty() {
        let nodes = arena(vec![node_fixture("srv", NodeRole::Server, 2, Some(20))]);
        assert_eq!(compute(&nodes, RESOLVER)["srv"], Projection::default());
    }

    #[test]
    fn test_peer_order_follows_creation_time() {
        let mut late = node_fixture("aaa", NodeRole::Client, 5, None);
        late.created_at = 100;
        let mut early = node_fixture("zzz", NodeRole::Client, 6, None);
        early.created_at = 10;
        let nodes = arena(vec![
            node_fixture("gw", NodeRole::Gateway, 1, Some(19)),
            late,
            early,
        ]);

        let ids: Vec<String> = compute(&nodes, RESOLVER)["gw"]
            .peers
            .iter()
            .map(|p| p.node_id.clone())
            .collect();
        assert_eq!(ids, vec!["zzz", "aaa"]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut nodes = sample_mesh();
        let changed = apply(&mut nodes, RESOLVER);
        assert_eq!(changed.len(), 3);

        let snapshot = nodes.clone();
        assert!(apply(&mut nodes, RESOLVER).is_empty());
        for (id, node) in &nodes {
            assert_eq!(node.peers, snapshot[id].peers);
            assert_eq!(node.dns, snapshot[id].dns);
        }
    }
}
