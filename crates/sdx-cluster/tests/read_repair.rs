//! Read repair against fake replicas.

mod common;

use common::*;
use sdx_cluster::bucket::DEFAULT_BUCKET;
use sdx_cluster::{NodeReadMerger, NodeReadRepairer, ReadRepairer};
use std::sync::Arc;
use std::time::Duration;

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

fn merged_nodes(client: &FakeNodeClient) -> Vec<u64> {
    let mut nodes: Vec<u64> = client.merges().iter().map(Call::node_id).collect();
    nodes.sort_unstable();
    nodes
}

#[tokio::test]
async fn test_only_lagging_replicas_are_repaired() {
    let a = write("a", "A", 1);
    let b = write("b", "B", 1);
    let union = a.merge(&b);

    let merger = Arc::new(NodeReadMerger::new());
    merger.insert_key_replica(2, "k", a.clone());
    merger.insert_key_replica(3, "k", union.clone());
    merger.insert_key_replica(4, "k", b.clone());

    let client = Arc::new(FakeNodeClient::new(1));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(1), 8);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, merger);

    wait_for(|| client.merges().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(merged_nodes(&client), vec![2, 4]);
    for call in client.merges() {
        if let Call::Merge {
            patch,
            broadcast_to_relays,
            ..
        } = call
        {
            assert_eq!(patch.get("k"), Some(&union));
            assert!(!broadcast_to_relays);
        }
    }
}

#[tokio::test]
async fn test_converged_replicas_need_no_repair() {
    let a = write("a", "A", 1);
    let merger = Arc::new(NodeReadMerger::new());
    merger.insert_key_replica(2, "k", a.clone());
    merger.insert_key_replica(3, "k", a);

    let client = Arc::new(FakeNodeClient::new(1));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(1), 8);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, merger);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_one_merge_per_node_carries_every_key() {
    let merger = Arc::new(NodeReadMerger::new());
    merger.insert_key_replica(2, "k1", write("a", "A", 1));
    merger.insert_key_replica(2, "k2", write("a", "B", 1));
    merger.insert_node(3);

    let client = Arc::new(FakeNodeClient::new(1));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(1), 8);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, merger);

    wait_for(|| client.merges().len() == 1).await;
    match &client.merges()[0] {
        Call::Merge { node_id, patch, .. } => {
            assert_eq!(*node_id, 3);
            assert_eq!(patch.len(), 2);
        }
        other => panic!("unexpected call {:?}", other),
    }
    assert_eq!(client.stored(3, "k1"), write("a", "A", 1));
}

#[tokio::test]
async fn test_failed_repair_does_not_block_others() {
    let merger = Arc::new(NodeReadMerger::new());
    merger.insert_key_replica(2, "k", write("a", "A", 1));
    merger.insert_node(3);
    merger.insert_node(4);

    let client = Arc::new(FakeNodeClient::new(1).failing(3));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(1), 8);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, merger);

    wait_for(|| client.merges().len() == 2).await;
    wait_for(|| !client.stored(4, "k").is_empty()).await;
    assert!(client.stored(3, "k").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_repairs_queue_behind_a_slow_replica() {
    let client = Arc::new(FakeNodeClient::new(1).slow(3, Duration::from_secs(30)));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(60), 1);

    let slow = Arc::new(NodeReadMerger::new());
    slow.insert_key_replica(2, "k", write("a", "A", 1));
    slow.insert_node(3);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, slow);
    tokio::time::sleep(Duration::from_millis(1)).await;

    let healthy = Arc::new(NodeReadMerger::new());
    healthy.insert_key_replica(2, "other", write("b", "B", 1));
    healthy.insert_node(4);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, healthy);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(merged_nodes(&client), vec![3]);
    assert!(client.stored(4, "other").is_empty());

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(merged_nodes(&client), vec![3, 4]);
    assert_eq!(client.stored(4, "other"), write("b", "B", 1));
    assert_eq!(client.stored(3, "k"), write("a", "A", 1));
}

#[tokio::test]
async fn test_concurrent_repairs_all_land() {
    let client = Arc::new(FakeNodeClient::new(1));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(1), 1);

    for node_id in 3..8 {
        let merger = Arc::new(NodeReadMerger::new());
        merger.insert_key_replica(2, "k", write("a", "A", 1));
        merger.insert_node(node_id);
        repairer.begin_repair(0, SITE, DEFAULT_BUCKET, merger);
    }

    wait_for(|| client.merges().len() == 5).await;
    assert_eq!(merged_nodes(&client), vec![3, 4, 5, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_in_flight_repairs() {
    let client = Arc::new(FakeNodeClient::new(1).slow(3, Duration::from_secs(30)));
    let repairer = ReadRepairer::new(Arc::clone(&client), Duration::from_secs(60), 4);

    let merger = Arc::new(NodeReadMerger::new());
    merger.insert_key_replica(2, "k", write("a", "A", 1));
    merger.insert_node(3);
    repairer.begin_repair(0, SITE, DEFAULT_BUCKET, merger);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.merges().len(), 1);
    repairer.stop_repairs();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.stored(3, "k").is_empty());
}
