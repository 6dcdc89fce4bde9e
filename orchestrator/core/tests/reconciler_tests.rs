// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Activation reconcilers and the event-driven driver on a simulated cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_retries, TestCluster};
use lvblob_core::application::attachment::AttachmentService;
use lvblob_core::application::reconcile_driver::ReconcileDriver;
use lvblob_core::application::reconciler::{
    NodeActivationReconciler, PoolActivationReconciler, ReconcileError, ReconcileOutcome,
};
use lvblob_core::domain::activation::{WorkItem, WorkItemKind};
use lvblob_core::domain::blob::BlobName;
use lvblob_core::domain::pool::{Holder, NodeId, PoolName};
use tokio_util::sync::CancellationToken;

fn pool_reconciler(cluster: &TestCluster) -> PoolActivationReconciler {
    PoolActivationReconciler::new(
        cluster.repositories.activations.clone(),
        cluster.event_bus.clone(),
        fast_retries(),
    )
}

fn node_reconciler(cluster: &TestCluster, node: &str) -> NodeActivationReconciler {
    NodeActivationReconciler::new(
        NodeId::from(node),
        cluster.repositories.activations.clone(),
        cluster.engine(node),
        Arc::new(cluster.sim.clone()),
        cluster.event_bus.clone(),
    )
}

/// Call `reconcile` until it converges, failing the test on an error.
async fn converge(reconciler: &NodeActivationReconciler, pool: &PoolName) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match reconciler.reconcile(pool).await {
            Ok(ReconcileOutcome::Converged) => return,
            Ok(ReconcileOutcome::NotYet { .. }) => {}
            Err(e) => panic!("reconcile failed: {}", e),
        }
        assert!(tokio::time::Instant::now() < deadline, "{} never converged", pool);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_stage_item_attaches_on_staging_node() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let pools = pool_reconciler(&cluster);
    let n1 = node_reconciler(&cluster, "n1");
    let n2 = node_reconciler(&cluster, "n2");

    let item = WorkItem::new(
        BlobName::from("a"),
        WorkItemKind::Stage { node: NodeId::from("n2") },
        NodeId::from("n1"),
    );
    let activation = pools.add_work_item(&pool, item.clone()).await.unwrap();
    assert_eq!(activation.assigned_node, Some(NodeId::from("n1")));

    // nothing targets n1
    assert_eq!(n1.reconcile(&pool).await.unwrap(), ReconcileOutcome::Converged);
    assert_eq!(n1.running_tasks(), 0);

    converge(&n2, &pool).await;
    let holder = Holder::new(BlobName::from("a"), NodeId::from("n2"), item.cookie());
    let state = cluster.pool("a").await;
    assert!(state.contains(&holder));
    assert_eq!(state.active_on, Some(NodeId::from("n2")));
    cluster.assert_consistent("a").await;
    let activation = pools.get(&pool).await.unwrap().unwrap();
    assert!(activation.observed.contains(&holder));

    let activation = pools.complete_work_item(&pool, item.id).await.unwrap();
    assert_eq!(activation.assigned_node, None);
    converge(&n2, &pool).await;

    assert!(cluster.pool("a").await.is_idle());
    assert!(pools.get(&pool).await.unwrap().unwrap().observed.is_empty());
    cluster.assert_consistent("a").await;
}

#[tokio::test]
async fn test_create_item_attaches_on_requester() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let pools = pool_reconciler(&cluster);
    let n2 = node_reconciler(&cluster, "n2");

    let item = WorkItem::new(BlobName::from("a"), WorkItemKind::Create, NodeId::from("n2"));
    pools.add_work_item(&pool, item.clone()).await.unwrap();
    converge(&n2, &pool).await;

    let state = cluster.pool("a").await;
    assert_eq!(state.active_on, Some(NodeId::from("n2")));
    assert!(state.contains(&Holder::new(BlobName::from("a"), NodeId::from("n2"), item.cookie())));
}

#[tokio::test]
async fn test_work_without_activation_needs_no_tasks() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let pools = pool_reconciler(&cluster);
    let n1 = node_reconciler(&cluster, "n1");

    let item = WorkItem::new(BlobName::from("a"), WorkItemKind::Delete, NodeId::from("n1"));
    let activation = pools.add_work_item(&pool, item).await.unwrap();
    assert_eq!(activation.assigned_node, None);

    assert_eq!(pools.reconcile(&pool).await.unwrap(), ReconcileOutcome::Converged);
    assert_eq!(n1.reconcile(&pool).await.unwrap(), ReconcileOutcome::Converged);
    assert_eq!(n1.running_tasks(), 0);
    assert!(cluster.pool("a").await.is_idle());
}

#[tokio::test]
async fn test_unknown_pool_is_converged() {
    let cluster = TestCluster::new(&["n1"]);
    let pool = PoolName::from("nothing-here");
    assert!(pool_reconciler(&cluster).reconcile(&pool).await.unwrap().is_converged());
    assert!(node_reconciler(&cluster, "n1").reconcile(&pool).await.unwrap().is_converged());
}

#[tokio::test]
async fn test_failed_task_surfaces_then_retries() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let pools = pool_reconciler(&cluster);
    let n1 = node_reconciler(&cluster, "n1");

    cluster.sim.fail_next("activate_thin_pool");
    let item = WorkItem::new(BlobName::from("a"), WorkItemKind::Snapshot, NodeId::from("n1"));
    pools.add_work_item(&pool, item).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let error = loop {
        match n1.reconcile(&pool).await {
            Err(e) => break e,
            Ok(ReconcileOutcome::NotYet { .. }) => {}
            Ok(ReconcileOutcome::Converged) => panic!("converged despite the injected fault"),
        }
        assert!(tokio::time::Instant::now() < deadline, "task never finished");
        tokio::time::sleep(Duration::from_millis(2)).await;
    };
    assert!(matches!(error, ReconcileError::Attachment(_)));
    assert!(cluster.pool("a").await.is_idle());

    // the failed task was reaped, so the next pass starts a fresh one
    converge(&n1, &pool).await;
    assert_eq!(cluster.pool("a").await.active_on, Some(NodeId::from("n1")));
    cluster.assert_consistent("a").await;
}

#[tokio::test]
async fn test_driver_reacts_to_work_item_changes() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let pools = Arc::new(pool_reconciler(&cluster));
    let driver = Arc::new(ReconcileDriver::new(
        pools.clone(),
        Arc::new(node_reconciler(&cluster, "n1")),
        cluster.repositories.activations.clone(),
        cluster.event_bus.clone(),
    ));
    let shutdown = CancellationToken::new();
    let handle = driver.start(shutdown.clone());
    // let the driver subscribe before the first event
    tokio::time::sleep(Duration::from_millis(20)).await;

    let item = WorkItem::new(BlobName::from("a"), WorkItemKind::Export, NodeId::from("n1"));
    pools.add_work_item(&pool, item.clone()).await.unwrap();

    let cluster_ref = &cluster;
    let pools_ref = &pools;
    let pool_ref = &pool;
    eventually("holder attached and observed", || async move {
        let attached = cluster_ref.pool("a").await.holders.len() == 1;
        let observed = pools_ref
            .get(pool_ref)
            .await
            .unwrap()
            .is_some_and(|a| a.observed.len() == 1);
        attached && observed
    })
    .await;
    cluster.assert_consistent("a").await;

    pools.complete_work_item(&pool, item.id).await.unwrap();
    eventually("pool released", || async move {
        let idle = cluster_ref.pool("a").await.is_idle();
        let observed = pools_ref
            .get(pool_ref)
            .await
            .unwrap()
            .is_some_and(|a| a.observed.is_empty());
        idle && observed
    })
    .await;
    cluster.assert_consistent("a").await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("driver stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_vanished_export_is_restarted_on_active_node() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let engine = cluster.engine("n1");
    engine.attach_blob(&BlobName::from("a"), None, "c1").await.unwrap();
    engine
        .attach_blob(&BlobName::from("a"), Some(NodeId::from("n2")), "c2")
        .await
        .unwrap();

    cluster.sim.restart_relay_daemon(&NodeId::from("n1"));
    assert_eq!(cluster.sim.export_count(), 0);
    assert!(cluster.sim.verify_pool(&cluster.pool("a").await).is_err());

    // the consumer side cannot serve the export
    let n2 = node_reconciler(&cluster, "n2");
    assert_eq!(n2.reconcile(&pool).await.unwrap(), ReconcileOutcome::Converged);
    assert_eq!(cluster.sim.export_count(), 0);

    let n1 = node_reconciler(&cluster, "n1");
    assert!(matches!(
        n1.reconcile(&pool).await.unwrap(),
        ReconcileOutcome::NotYet { .. }
    ));
    assert_eq!(cluster.sim.export_count(), 1);
    cluster.assert_consistent("a").await;
    assert_eq!(n1.reconcile(&pool).await.unwrap(), ReconcileOutcome::Converged);
}

#[tokio::test]
async fn test_direct_only_pool_needs_no_export() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    cluster
        .engine("n1")
        .attach_blob(&BlobName::from("a"), None, "c1")
        .await
        .unwrap();

    let n1 = node_reconciler(&cluster, "n1");
    assert_eq!(n1.reconcile(&PoolName::from("a")).await.unwrap(), ReconcileOutcome::Converged);
    assert_eq!(cluster.sim.export_count(), 0);
}

#[tokio::test]
async fn test_driver_drops_pool_locks_after_reconciling() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    let pool = PoolName::from("a");
    let pools = Arc::new(pool_reconciler(&cluster));
    let driver = ReconcileDriver::new(
        pools.clone(),
        Arc::new(node_reconciler(&cluster, "n1")),
        cluster.repositories.activations.clone(),
        cluster.event_bus.clone(),
    );

    let item = WorkItem::new(BlobName::from("a"), WorkItemKind::Delete, NodeId::from("n1"));
    pools.add_work_item(&pool, item).await.unwrap();
    driver.reconcile_pool(&pool).await.unwrap();
    driver.reconcile_pool(&PoolName::from("deleted")).await.unwrap();

    assert_eq!(driver.busy_pools(), 0);
}
