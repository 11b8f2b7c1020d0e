//! Broadcast and failure policy tests

mod common;

use common::{Cluster, key_on_shard};
use shardkv::{
    ClientConfig, ClusterError, Command, FailurePolicy, Op, Reply, Response,
};

#[tokio::test]
async fn test_dbsize_reports_every_node() {
    let cluster = Cluster::with_slaves(2);
    let client = cluster.client().await;
    for key in ["a", "b", "c", "d", "e"] {
        client
            .call(Command::new(Op::Set).arg(key).arg("v"))
            .await
            .unwrap();
    }

    let response = client.execute(Command::new(Op::Dbsize)).await.unwrap();
    let per_node = response.per_node().unwrap();
    assert_eq!(per_node.len(), 4);
    let total: i64 = ["node_1", "node_2"]
        .iter()
        .map(|alias| per_node[*alias].as_int().unwrap())
        .sum();
    assert_eq!(total, 5);
    assert_eq!(per_node["node_1_slave"], Reply::Int(0));
}

#[tokio::test]
async fn test_broadcast_omits_unreachable_node() {
    let cluster = Cluster::with_slaves(2);
    let client = cluster.client().await;
    cluster.slave(2).set_reachable(false);

    let response = client.execute(Command::new(Op::Ping)).await.unwrap();
    let per_node = response.per_node().unwrap();
    assert_eq!(per_node.len(), 3);
    assert!(!per_node.contains_key("node_2_slave"));
    assert!(
        per_node
            .values()
            .all(|r| *r == Reply::Status("PONG".to_string()))
    );
}

#[tokio::test]
async fn test_keys_are_concatenated() {
    let cluster = Cluster::with_slaves(3);
    let client = cluster.client().await;
    let keys: Vec<String> = (1..=3).map(|shard| key_on_shard("user:", shard, 3)).collect();
    for key in &keys {
        client
            .call(Command::new(Op::Set).arg(key).arg("v"))
            .await
            .unwrap();
    }

    let response = client
        .execute(Command::new(Op::Keys).arg("user:*"))
        .await
        .unwrap();
    let Response::Concatenated(found) = response else {
        panic!("keys should be concatenated");
    };
    let mut found: Vec<_> = found.into_iter().filter_map(Reply::into_bytes).collect();
    found.sort();
    let mut expected: Vec<_> = keys.into_iter().map(String::into_bytes).collect();
    expected.sort();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_getkeys_goes_out_as_keys() {
    let cluster = Cluster::with_slaves(2);
    let client = cluster.client().await;
    let keys: Vec<String> = (1..=2).map(|shard| key_on_shard("user:", shard, 2)).collect();
    for key in &keys {
        client
            .call(Command::new(Op::Set).arg(key).arg("v"))
            .await
            .unwrap();
    }
    cluster.clear_served();

    let response = client
        .execute(Command::new(Op::Getkeys).arg("user:*"))
        .await
        .unwrap();
    let Response::Concatenated(found) = response else {
        panic!("getkeys should be concatenated");
    };
    let mut found: Vec<_> = found.into_iter().filter_map(Reply::into_bytes).collect();
    found.sort();
    let mut expected: Vec<_> = keys.into_iter().map(String::into_bytes).collect();
    expected.sort();
    assert_eq!(found, expected);

    for shard in 1..=2 {
        assert_eq!(cluster.master(shard).served(), vec!["keys user:*"]);
        assert_eq!(cluster.slave(shard).served(), vec!["keys user:*"]);
    }
}

#[tokio::test]
async fn test_write_broadcast_reaches_masters_once() {
    let cluster = Cluster::with_slaves(2);
    cluster.slave(1).set_reachable(false);
    let client = cluster.client().await;

    let response = client.execute(Command::new(Op::Flushdb)).await.unwrap();
    let aliases: Vec<_> = response.per_node().unwrap().keys().cloned().collect();
    assert_eq!(aliases, vec!["node_1", "node_2"]);

    // the failed-over slave alias shares node_1's server but is not a target
    let flushes = cluster
        .master(1)
        .served()
        .into_iter()
        .filter(|c| c == "flushdb")
        .count();
    assert_eq!(flushes, 1);
    assert!(cluster.slave(2).served().is_empty());
}

#[tokio::test]
async fn test_read_broadcast_includes_failed_over_alias() {
    let cluster = Cluster::with_slaves(2);
    cluster.slave(1).set_reachable(false);
    let client = cluster.client().await;
    let key = key_on_shard("k", 1, 2);
    client
        .call(Command::new(Op::Set).arg(&key).arg("v"))
        .await
        .unwrap();

    let response = client.execute(Command::new(Op::Dbsize)).await.unwrap();
    let per_node = response.per_node().unwrap();
    assert_eq!(per_node["node_1_slave"], Reply::Int(1));
}

#[tokio::test]
async fn test_call_rejects_broadcast() {
    let cluster = Cluster::with_slaves(1);
    let client = cluster.client().await;

    let err = client.call(Command::new(Op::Dbsize)).await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidArguments { .. }));
}

#[tokio::test]
async fn test_quiet_policy_returns_nil_on_transport_failure() {
    let cluster = Cluster::with_slaves(2);
    let client = cluster.client().await;
    let key = key_on_shard("k", 2, 2);
    cluster.master(2).set_reachable(false);

    let reply = client
        .call(Command::new(Op::Set).arg(&key).arg("v"))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Nil);

    // emulated operations fail as a whole
    cluster.slave(2).set_reachable(false);
    let other = key_on_shard("k", 1, 2);
    let values = client.mget(&[other.as_str(), key.as_str()]).await;
    assert_eq!(values.unwrap(), Vec::<Option<Vec<u8>>>::new());
}

#[tokio::test]
async fn test_strict_policy_returns_transport_error() {
    let cluster = Cluster::with_slaves(2);
    let client = cluster
        .client_with(ClientConfig::new().with_failure_policy(FailurePolicy::Strict))
        .await;
    let key = key_on_shard("k", 2, 2);
    cluster.master(2).set_reachable(false);

    let err = client
        .call(Command::new(Op::Set).arg(&key).arg("v"))
        .await
        .unwrap_err();
    match err {
        ClusterError::Transport {
            command,
            alias,
            endpoint,
            ..
        } => {
            assert_eq!(command, "set");
            assert_eq!(alias, "node_2");
            assert_eq!(endpoint, "10.0.0.2:6379");
        }
        other => panic!("unexpected error: {}", other),
    }

    // the connection is kept; the node answers again once it is back
    cluster.master(2).set_reachable(true);
    let reply = client
        .call(Command::new(Op::Set).arg(&key).arg("v"))
        .await
        .unwrap();
    assert_eq!(reply, Reply::ok());
}
