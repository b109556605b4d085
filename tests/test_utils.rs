use hermes_store::{ClusterNode, NetworkServer, ProtocolConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;

pub fn node_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

/// Millisecond-scale tunables so stall and retry scenarios finish fast.
pub fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        message_loss_timeout: Duration::from_millis(200),
        replay_timeout: Duration::from_millis(250),
        retry_backoff_base: Duration::from_millis(20),
        retry_backoff_cap: Duration::from_millis(100),
        heartbeat_period: Duration::from_millis(40),
        heartbeat_deadline: Duration::from_millis(30),
        ..ProtocolConfig::default()
    }
}

/// Spawn one cluster member listening on `port`, serving real TCP.
pub async fn spawn_node(port: u16, cluster_ports: &[u16]) -> Arc<ClusterNode> {
    let peers: Vec<SocketAddr> = cluster_ports
        .iter()
        .filter(|p| **p != port)
        .map(|p| node_addr(*p))
        .collect();
    let node = Arc::new(ClusterNode::new(
        node_addr(port),
        peers,
        test_config(),
        None,
    ));

    let server = NetworkServer::new(Arc::clone(&node), node.address);
    tokio::spawn(async move { server.start().await });

    node
}

pub struct TestCluster {
    pub node1: Arc<ClusterNode>,
    pub node2: Arc<ClusterNode>,
    pub node3: Arc<ClusterNode>,
}

pub async fn setup_test_cluster(base_port: u16) -> TestCluster {
    let ports = [base_port, base_port + 1, base_port + 2];
    let node1 = spawn_node(ports[0], &ports).await;
    let node2 = spawn_node(ports[1], &ports).await;
    let node3 = spawn_node(ports[2], &ports).await;

    // Give the listeners time to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestCluster {
        node1,
        node2,
        node3,
    }
}
