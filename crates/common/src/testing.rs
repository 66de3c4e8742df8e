//! Fixtures shared by unit tests

use crate::pki::ClientBundle;
use crate::{Node, NodeRole, PendingJoinRequest};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

fn dummy_bundle(cn: &str) -> ClientBundle {
    ClientBundle {
        root_cert_pem: "root".into(),
        cert_pem: format!("cert-{}", cn),
        key_pem: format!("key-{}", cn),
    }
}

/// Node at `10.0.0.<host>`, optionally holding `172.<octet>.0.0/16`
pub fn node_fixture(id: &str, role: NodeRole, host: u8, subnet_octet: Option<u8>) -> Node {
    Node {
        id: id.to_string(),
        role,
        private_address: Ipv4Addr::new(10, 0, 0, host),
        public_key: format!("pub-{}", id),
        private_key: format!("priv-{}", id),
        peers: Vec::new(),
        dns: Vec::new(),
        docker_subnet: subnet_octet
            .map(|octet| Ipv4Network::new(Ipv4Addr::new(172, octet, 0, 0), 16).unwrap()),
        identity: dummy_bundle(id),
        ca: None,
        endpoint: (role == NodeRole::Gateway).then(|| "gw.example.net:51820".to_string()),
        is_current: false,
        created_at: i64::from(host),
    }
}

pub fn pending_fixture(id: &str, role: NodeRole) -> PendingJoinRequest {
    PendingJoinRequest {
        id: id.to_string(),
        role,
        gateway_address: "gw.example.net:8443".into(),
        ephemeral_identity: dummy_bundle(id),
        forced_docker_subnet: None,
    }
}
