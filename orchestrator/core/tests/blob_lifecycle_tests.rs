// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blob create / clone / expand / delete against the simulated cluster.

mod common;

use common::{TestCluster, BLOB_SIZE, VG};
use lvblob_core::application::attachment::{AttachmentError, AttachmentService, ErrorCategory};
use lvblob_core::application::blob_manager::BlobService;
use lvblob_core::domain::blob::{BlobError, BlobName};
use lvblob_core::domain::events::BlobEvent;
use lvblob_core::domain::pool::{NodeId, PoolName};
use lvblob_core::domain::repository::PoolStateStore;
use lvblob_core::domain::volume::LvRef;
use lvblob_core::infrastructure::event_bus::DomainEvent;

#[tokio::test]
async fn test_create_makes_pool_and_thin_volume() {
    let cluster = TestCluster::new(&["n1"]);
    let mut events = cluster.event_bus.subscribe();

    let blob = cluster.create_blob("n1", "a").await;

    assert_eq!(blob.pool, PoolName::from("a"));
    assert!(cluster.sim.lv_exists(&LvRef::new(VG, "a-thinpool")));
    assert_eq!(cluster.sim.lv_size(&LvRef::new(VG, "a")), Some(BLOB_SIZE));
    let state = cluster.pool("a").await;
    assert!(state.is_idle());
    assert!(state.blobs.contains(&BlobName::from("a")));
    assert!(matches!(
        events.recv().await.unwrap(),
        DomainEvent::Blob(BlobEvent::BlobCreated { .. })
    ));
}

#[tokio::test]
async fn test_create_is_idempotent_but_rejects_conflicting_redefinition() {
    let cluster = TestCluster::new(&["n1"]);
    let first = cluster.create_blob("n1", "a").await;
    let again = cluster.create_blob("n1", "a").await;
    assert_eq!(first, again);

    let err = cluster
        .blobs("n1")
        .create_blob(BlobName::from("a"), VG, BLOB_SIZE * 2)
        .await
        .unwrap_err();
    assert!(matches!(err, AttachmentError::Blob(BlobError::AlreadyExists(_))));
    assert_eq!(err.category(), ErrorCategory::FailedPrecondition);
}

#[tokio::test]
async fn test_create_rejects_unaligned_size() {
    let cluster = TestCluster::new(&["n1"]);
    let err = cluster
        .blobs("n1")
        .create_blob(BlobName::from("a"), VG, 1000)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidArgument);
}

#[tokio::test]
async fn test_clone_shares_source_pool() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;

    let copy = cluster
        .blobs("n1")
        .clone_blob(BlobName::from("b"), &BlobName::from("a"))
        .await
        .unwrap();

    assert_eq!(copy.pool, PoolName::from("a"));
    assert_eq!(copy.size_bytes, BLOB_SIZE);
    assert!(cluster.sim.lv_exists(&LvRef::new(VG, "b")));
    assert_eq!(cluster.pool("a").await.blobs.len(), 2);
    assert_eq!(
        cluster
            .blobs("n1")
            .list_pool_blobs(&PoolName::from("a"))
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_clone_of_missing_source_is_not_found() {
    let cluster = TestCluster::new(&["n1"]);
    let err = cluster
        .blobs("n1")
        .clone_blob(BlobName::from("b"), &BlobName::from("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

#[tokio::test]
async fn test_clone_runs_on_active_node() {
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.create_blob("n1", "a").await;
    cluster
        .engine("n1")
        .attach_blob(&BlobName::from("a"), Some(NodeId::from("n2")), "c")
        .await
        .unwrap();
    cluster.sim.clear_ops();

    // requested from n1 while the pool is active on n2
    cluster
        .blobs("n1")
        .clone_blob(BlobName::from("b"), &BlobName::from("a"))
        .await
        .unwrap();

    assert!(cluster.sim.ops().iter().any(|op| op == "snapshot_thin_lv n2 vg0/b"));
    cluster.assert_consistent("a").await;
}

#[tokio::test]
async fn test_delete_refuses_attached_blob() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    cluster
        .engine("n1")
        .attach_blob(&BlobName::from("a"), None, "c")
        .await
        .unwrap();

    let err = cluster.blobs("n1").delete_blob(&BlobName::from("a")).await.unwrap_err();
    assert!(matches!(err, AttachmentError::Blob(BlobError::StillAttached { holders: 1, .. })));
    assert_eq!(err.category(), ErrorCategory::FailedPrecondition);
    assert!(cluster.sim.lv_exists(&LvRef::new(VG, "a")));
}

#[tokio::test]
async fn test_pool_goes_with_its_last_blob() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    let service = cluster.blobs("n1");
    service
        .clone_blob(BlobName::from("b"), &BlobName::from("a"))
        .await
        .unwrap();

    service.delete_blob(&BlobName::from("a")).await.unwrap();
    let state = cluster.pool("a").await;
    assert_eq!(state.blobs.len(), 1);
    assert!(!cluster.sim.lv_exists(&LvRef::new(VG, "a")));
    assert!(cluster.sim.lv_exists(&LvRef::new(VG, "a-thinpool")));

    service.delete_blob(&BlobName::from("b")).await.unwrap();
    assert!(cluster
        .repositories
        .pools
        .get(&PoolName::from("a"))
        .await
        .unwrap()
        .is_none());
    assert!(!cluster.sim.lv_exists(&LvRef::new(VG, "a-thinpool")));

    // deleting again is a no-op
    service.delete_blob(&BlobName::from("b")).await.unwrap();
}

#[tokio::test]
async fn test_expand_only_grows_unattached_blobs() {
    let cluster = TestCluster::new(&["n1"]);
    cluster.create_blob("n1", "a").await;
    let service = cluster.blobs("n1");
    let name = BlobName::from("a");

    let grown = service.expand_blob(&name, BLOB_SIZE * 2).await.unwrap();
    assert_eq!(grown.size_bytes, BLOB_SIZE * 2);
    assert_eq!(cluster.sim.lv_size(&LvRef::new(VG, "a")), Some(BLOB_SIZE * 2));
    assert_eq!(service.get_blob(&name).await.unwrap().size_bytes, BLOB_SIZE * 2);

    let shrink = service.expand_blob(&name, BLOB_SIZE).await.unwrap_err();
    assert!(matches!(shrink, AttachmentError::Blob(BlobError::CannotShrink { .. })));

    cluster.engine("n1").attach_blob(&name, None, "c").await.unwrap();
    let attached = service.expand_blob(&name, BLOB_SIZE * 4).await.unwrap_err();
    assert_eq!(attached.category(), ErrorCategory::FailedPrecondition);
}
