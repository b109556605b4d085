mod test_utils;

use hermes_store::network::send_to;
use hermes_store::{ClusterMessage, NetworkClient, NodeId};
use test_utils::{node_addr, setup_test_cluster, spawn_node};
use tokio::time::Duration;

#[tokio::test]
async fn single_node_serves_reads_and_writes() -> Result<(), Box<dyn std::error::Error>> {
    spawn_node(50061, &[50061]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = NetworkClient::new(node_addr(50061));

    let response = client.send(&ClusterMessage::Heartbeat).await?;
    assert!(matches!(response, ClusterMessage::HeartbeatAck));

    // A sole member accepts its own writes without anyone to invalidate.
    let response = client
        .send(&ClusterMessage::WriteRequest {
            key: "color".to_owned(),
            value: "teal".to_owned(),
        })
        .await?;
    assert!(matches!(response, ClusterMessage::WriteAck));

    let response = client
        .send(&ClusterMessage::ReadRequest {
            key: "color".to_owned(),
        })
        .await?;
    match response {
        ClusterMessage::ReadResponse { value } => assert_eq!(value.as_deref(), Some("teal")),
        other => panic!("unexpected response: {other:?}"),
    }

    let response = client
        .send(&ClusterMessage::ReadRequest {
            key: "missing".to_owned(),
        })
        .await?;
    match response {
        ClusterMessage::ReadResponse { value } => assert_eq!(value, None),
        other => panic!("unexpected response: {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn writes_propagate_to_every_replica() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = setup_test_cluster(50071).await;
    assert_eq!(cluster.node1.id, NodeId(50071));

    let response = send_to(
        cluster.node1.address,
        &ClusterMessage::WriteRequest {
            key: "k".to_owned(),
            value: "v1".to_owned(),
        },
    )
    .await?;
    assert!(matches!(response, ClusterMessage::WriteAck));

    // The followers' copies sit invalidated until the Validate lands; the
    // reads below stall on that rather than serving anything stale.
    for port in [50072, 50073] {
        let response = send_to(
            node_addr(port),
            &ClusterMessage::ReadRequest {
                key: "k".to_owned(),
            },
        )
        .await?;
        match response {
            ClusterMessage::ReadResponse { value } => assert_eq!(value.as_deref(), Some("v1")),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    // Any member coordinates writes for any key.
    let response = send_to(
        cluster.node2.address,
        &ClusterMessage::WriteRequest {
            key: "k".to_owned(),
            value: "v2".to_owned(),
        },
    )
    .await?;
    assert!(matches!(response, ClusterMessage::WriteAck));

    assert_eq!(cluster.node1.read("k").await?.as_deref(), Some("v2"));
    assert_eq!(cluster.node3.read("k").await?.as_deref(), Some("v2"));

    Ok(())
}

#[tokio::test]
async fn tie_break_prefers_the_higher_node_id() -> Result<(), Box<dyn std::error::Error>> {
    let a = spawn_node(50051, &[50051, 50052]).await;
    let b = spawn_node(50052, &[50051, 50052]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Both coordinators enter their write before either Invalidate is
    // delivered, so both stamp logical time 1 and the node id decides.
    let (from_a, from_b) = tokio::join!(a.write("k", "from-a"), b.write("k", "from-b"));
    from_a?;
    from_b?;

    assert_eq!(a.read("k").await?.as_deref(), Some("from-b"));
    assert_eq!(b.read("k").await?.as_deref(), Some("from-b"));

    Ok(())
}
