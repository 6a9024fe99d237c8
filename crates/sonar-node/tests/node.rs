//! Integration tests for the agent over loopback UDP

use sonar_node::config::Config;
use sonar_node::node::Node;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tempfile::TempDir;

fn loopback_config(data_dir: &TempDir, seeds: Vec<String>) -> Config {
    let mut config = Config {
        data_dir: data_dir.path().display().to_string(),
        ..Config::default()
    };
    config.discovery.listen_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.discovery.listen_port = 0;
    config.discovery.bootstrap_seeds = seeds;
    config.discovery.request_timeout_ms = 200;
    config.discovery.ping_interval_secs = 1;
    config
}

#[tokio::test]
async fn test_node_bootstraps_from_seed() {
    let seed_dir = TempDir::new().unwrap();
    let node_dir = TempDir::new().unwrap();

    let seed = Node::start(&loopback_config(&seed_dir, vec![])).await.unwrap();
    let node = Node::start(&loopback_config(&node_dir, vec![seed.enode_url()]))
        .await
        .unwrap();

    assert!(node.wait_for_peers(1, Duration::from_secs(5)).await);
    assert!(seed.wait_for_peers(1, Duration::from_secs(5)).await);

    let found = node.lookup(&seed.local_record().public_key).await.unwrap();
    assert_eq!(found.first().map(|r| r.id), Some(seed.local_record().id));

    node.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_node_key_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = loopback_config(&dir, vec![]);

    let first = Node::start(&config).await.unwrap();
    let id = first.local_record().id;
    first.shutdown().await;

    assert!(dir.path().join("nodekey").exists());
    let second = Node::start(&config).await.unwrap();
    assert_eq!(second.local_record().id, id);
    second.shutdown().await;
}

#[tokio::test]
async fn test_bad_bootnode_fails_start() {
    let dir = TempDir::new().unwrap();
    let config = loopback_config(&dir, vec!["not-an-enode".to_string()]);
    assert!(Node::start(&config).await.is_err());
}
