//! Private address and Docker subnet allocation
//!
//! Both pools are scanned linearly against the current membership and the
//! first free member wins, so results are deterministic for a given node set.
//! Callers pass the snapshot loaded inside their creation transaction.

use crate::error::Exhausted;
use crate::{Error, Node, NodeRole, PendingJoinRequest, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Second octets of the Docker subnet pool, `172.19.0.0/16` to `172.30.0.0/16`
const DOCKER_SUBNET_OCTETS: std::ops::RangeInclusive<u8> = 19..=30;

fn network(addr: Ipv4Addr, prefix: u8) -> Ipv4Network {
    Ipv4Network::new(addr, prefix).expect("prefix is at most 32")
}

/// The mesh's private `/24`
pub fn mesh_network() -> Ipv4Network {
    network(Ipv4Addr::new(10, 0, 0, 0), 24)
}

/// Range covering every Docker subnet, routed to clients through the gateway
pub fn docker_range() -> Ipv4Network {
    network(Ipv4Addr::new(172, 16, 0, 0), 12)
}

/// Host-only network for a single address
pub fn host_network(addr: Ipv4Addr) -> Ipv4Network {
    network(addr, 32)
}

/// Addresses `.1` through `.254` of the mesh network, in scan order
pub fn address_pool() -> impl Iterator<Item = Ipv4Addr> {
    (1u8..=254).map(|host| Ipv4Addr::new(10, 0, 0, host))
}

/// The Docker subnet pool, in scan order
pub fn subnet_pool() -> impl Iterator<Item = Ipv4Network> {
    DOCKER_SUBNET_OCTETS.map(|octet| network(Ipv4Addr::new(172, octet, 0, 0), 16))
}

/// First pool address not bound to any node
pub fn allocate_address<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Result<Ipv4Addr> {
    let taken: HashSet<Ipv4Addr> = nodes.into_iter().map(|n| n.private_address).collect();
    address_pool()
        .find(|addr| !taken.contains(addr))
        .ok_or(Error::ResourceExhausted(Exhausted::NoAddressAvailable))
}

/// First pool subnet not bound to any gateway or server, or `forced` when it
/// is a free pool member.
pub fn allocate_subnet<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    forced: Option<Ipv4Network>,
) -> Result<Ipv4Network> {
    let taken: HashSet<Ipv4Network> = nodes.into_iter().filter_map(|n| n.docker_subnet).collect();

    if let Some(subnet) = forced {
        let subnet = network(subnet.network(), subnet.prefix());
        if !subnet_pool().any(|member| member == subnet) {
            return Err(Error::SubnetOutOfPool(subnet.to_string()));
        }
        if taken.contains(&subnet) {
            return Err(Error::SubnetInUse(subnet.to_string()));
        }
        return Ok(subnet);
    }

    subnet_pool()
        .find(|subnet| !taken.contains(subnet))
        .ok_or(Error::ResourceExhausted(Exhausted::NoSubnetAvailable))
}

/// Advisory view of remaining capacity.
///
/// Outstanding join requests are counted as if they had already been
/// redeemed. Nothing is reserved; hard exhaustion is only detected by the
/// allocation functions at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub free_addresses: usize,
    pub free_subnets: usize,
}

impl Capacity {
    pub fn advisory(nodes: &[Node], pending: &[PendingJoinRequest]) -> Self {
        let used_addresses = nodes.len() + pending.len();
        let used_subnets = nodes.iter().filter(|n| n.docker_subnet.is_some()).count()
            + pending.iter().filter(|p| p.role == NodeRole::Server).count();

        Self {
            free_addresses: address_pool().count().saturating_sub(used_addresses),
            free_subnets: subnet_pool().count().saturating_sub(used_subnets),
        }
    }

    /// Whether one more node of `role` would plausibly fit
    pub fn admits(&self, role: NodeRole) -> bool {
        let needs_subnet = role.has_docker_subnet();
        self.free_addresses > 0 && (!needs_subnet || self.free_subnets > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node_fixture;

    #[test]
    fn test_pools() {
        assert_eq!(address_pool().count(), 254);
        assert_eq!(address_pool().next(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(address_pool().last(), Some(Ipv4Addr::new(10, 0, 0, 254)));

        let subnets: Vec<_> = subnet_pool().collect();
        assert_eq!(subnets.len(), 12);
        assert_eq!(subnets[0].to_string(), "172.19.0.0/16");
        assert_eq!(subnets[11].to_string(), "172.30.0.0/16");
        assert!(subnets.iter().all(|s| docker_range().contains(s.network())));
    }

    #[test]
    fn test_first_free_address_wins() {
        assert_eq!(allocate_address(std::iter::empty()).unwrap(), Ipv4Addr::new(10, 0, 0, 1));

        let a = node_fixture("a", NodeRole::Gateway, 1, Some(19));
        let c = node_fixture("c", NodeRole::Client, 3, None);
        // .2 is a gap left by a deleted node
        assert_eq!(
            allocate_address([&a, &c]).unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_address_exhaustion() {
        let nodes: Vec<Node> = (1u8..=254)
            .map(|host| node_fixture(&format!("n{}", host), NodeRole::Client, host, None))
            .collect();
        assert!(matches!(
            allocate_address(&nodes),
            Err(Error::ResourceExhausted(Exhausted::NoAddressAvailable))
        ));
    }

    #[test]
    fn test_subnet_allocation_skips_holders() {
        let gw = node_fixture("gw", NodeRole::Gateway, 1, Some(19));
        let client = node_fixture("c", NodeRole::Client, 2, None);
        let subnet = allocate_subnet([&gw, &client], None).unwrap();
        assert_eq!(subnet.to_string(), "172.20.0.0/16");
    }

    #[test]
    fn test_forced_subnet() {
        let gw = node_fixture("gw", NodeRole::Gateway, 1, Some(19));

        let wanted: Ipv4Network = "172.25.0.0/16".parse().unwrap();
        assert_eq!(allocate_subnet([&gw], Some(wanted)).unwrap(), wanted);

        let taken: Ipv4Network = "172.19.0.0/16".parse().unwrap();
        assert!(matches!(
            allocate_subnet([&gw], Some(taken)),
            Err(Error::SubnetInUse(_))
        ));

        for outside in ["172.31.0.0/16", "192.168.0.0/16", "172.20.0.0/24"] {
            let outside: Ipv4Network = outside.parse().unwrap();
            assert!(matches!(
                allocate_subnet([&gw], Some(outside)),
                Err(Error::SubnetOutOfPool(_))
            ));
        }
    }

    #[test]
    fn test_subnet_exhaustion() {
        let holders: Vec<Node> = (0u8..12)
            .map(|i| node_fixture(&format!("s{}", i), NodeRole::Server, i + 1, Some(19 + i)))
            .collect();
        assert!(matches!(
            allocate_subnet(&holders, None),
            Err(Error::ResourceExhausted(Exhausted::NoSubnetAvailable))
        ));
        // Clients still fit
        assert!(allocate_address(&holders).is_ok());
    }

    #[test]
    fn test_advisory_capacity_counts_pending() {
        let holders: Vec<Node> = (0u8..11)
            .map(|i| node_fixture(&format!("s{}", i), NodeRole::Server, i + 1, Some(19 + i)))
            .collect();

        let capacity = Capacity::advisory(&holders, &[]);
        assert_eq!(capacity.free_subnets, 1);
        assert_eq!(capacity.free_addresses, 254 - 11);
        assert!(capacity.admits(NodeRole::Server));

        let pending = vec![crate::testing::pending_fixture("p1", NodeRole::Server)];
        let capacity = Capacity::advisory(&holders, &pending);
        assert_eq!(capacity.free_subnets, 0);
        assert!(!capacity.admits(NodeRole::Server));
        assert!(capacity.admits(NodeRole::Client));

        // Advisory refusal does not affect hard allocation
        assert!(allocate_subnet(&holders, None).is_ok());
    }
}
