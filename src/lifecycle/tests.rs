//! Behavioural tests for the lifecycle primitives, driven through the
//! in-memory stub cloud.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::api::{LaunchSpecification, VolumeDescription};
use crate::progress::NullSink;
use crate::test_support::{MemoryKeyStore, StubEc2};

const TICK: Duration = Duration::from_millis(1);

#[tokio::test]
async fn deleting_an_already_absent_security_group_succeeds() {
    let cloud = StubEc2::new();
    delete_security_group(&cloud, "ghost", &NullSink)
        .await
        .expect("absent group should count as deleted");
}

#[tokio::test]
async fn deleting_a_security_group_propagates_other_failures() {
    let cloud = StubEc2::new();
    cloud.insert_security_group("held").await;
    cloud.fail_on_with_code("delete_security_group", "DependencyViolation").await;
    let err = delete_security_group(&cloud, "held", &NullSink)
        .await
        .expect_err("a dependency violation must surface");
    assert!(err.is_code("DependencyViolation"), "got {err:?}");
}

#[tokio::test]
async fn authorizing_no_rules_makes_no_remote_call() {
    let cloud = StubEc2::new();
    authorize_ingress(&cloud, "web", &[], &NullSink)
        .await
        .expect("empty rule list is a no-op");
    assert_eq!(cloud.call_count("authorize_ingress").await, 0);
}

#[tokio::test]
async fn re_authorizing_existing_rules_is_tolerated() {
    let cloud = StubEc2::new();
    cloud.insert_security_group("web").await;
    let rules = vec![IngressRule::tcp(22)];
    authorize_ingress(&cloud, "web", &rules, &NullSink)
        .await
        .expect("first authorization");
    authorize_ingress(&cloud, "web", &rules, &NullSink)
        .await
        .expect("duplicate rules must not fail the sequence");
    assert_eq!(cloud.ingress_rules("web").await.len(), 1);
}

#[tokio::test]
async fn key_pair_is_reused_when_fingerprint_still_matches() {
    let cloud = StubEc2::new();
    cloud.insert_key_pair("existing-key", "fp-match").await;
    let store = MemoryKeyStore::holding(StoredKey {
        material: String::from("stored-material"),
        fingerprint: String::from("fp-match"),
    });

    let handle = create_or_reuse_key_pair(&cloud, &store, &NullSink)
        .await
        .expect("reuse");

    assert_eq!(handle.name, "existing-key");
    assert_eq!(handle.material, "stored-material");
    assert_eq!(cloud.call_count("create_key_pair").await, 0);
}

#[tokio::test]
async fn stale_stored_key_is_replaced_with_a_fresh_pair() {
    let cloud = StubEc2::new();
    let store = MemoryKeyStore::holding(StoredKey {
        material: String::from("stale-material"),
        fingerprint: String::from("fp-forgotten"),
    });

    let handle = create_or_reuse_key_pair(&cloud, &store, &NullSink)
        .await
        .expect("create");

    assert!(handle.name.starts_with("ec2manager-"), "got {}", handle.name);
    let saved = store
        .load_key()
        .expect("load")
        .expect("a fresh key must be persisted");
    assert_eq!(saved.material, handle.material);
    assert_ne!(saved.fingerprint, "fp-forgotten");
}

#[tokio::test]
async fn termination_waits_until_the_instance_is_gone() {
    let cloud = StubEc2::new();
    let launch = LaunchSpecification {
        image_id: String::from("ami-1"),
        size_class: String::from("t2.micro"),
        key_name: String::from("key"),
        security_group: String::from("sg"),
        availability_zone: None,
    };
    let id = cloud.run_instance(&launch).await.expect("launch");

    terminate_instance(&cloud, &id, &CancellationToken::new(), TICK, &NullSink)
        .await
        .expect("terminate");

    let description = cloud.instance(&id).await.expect("still describable");
    assert_eq!(description.state, "terminated");
}

#[tokio::test]
async fn failed_attach_returns_the_device_to_the_pool() {
    let cloud = StubEc2::new();
    cloud.insert_snapshot("snap-1").await;
    let volume_id = cloud
        .create_volume_from_snapshot("snap-1", "us-east-1a")
        .await
        .expect("volume");
    cloud.fail_on("attach_volume").await;
    let allocator = MountPointAllocator::new();

    let err = attach_volume(
        &cloud,
        &allocator,
        &volume_id,
        "i-missing",
        &CancellationToken::new(),
        TICK,
        &NullSink,
    )
    .await
    .expect_err("attach should fail");

    assert!(matches!(err, Ec2Error::Api { .. }), "got {err:?}");
    assert_eq!(allocator.claimed().await, 0, "device must be reclaimed");
}

#[tokio::test]
async fn detach_and_delete_reclaims_the_device() {
    let cloud = StubEc2::new();
    let launch = LaunchSpecification {
        image_id: String::from("ami-1"),
        size_class: String::from("t2.micro"),
        key_name: String::from("key"),
        security_group: String::from("sg"),
        availability_zone: None,
    };
    let instance_id = cloud.run_instance(&launch).await.expect("launch");
    cloud.insert_snapshot("snap-1").await;
    let volume_id = cloud
        .create_volume_from_snapshot("snap-1", "us-east-1a")
        .await
        .expect("volume");
    let allocator = MountPointAllocator::new();
    let cancel = CancellationToken::new();
    let device = attach_volume(
        &cloud, &allocator, &volume_id, &instance_id, &cancel, TICK, &NullSink,
    )
    .await
    .expect("attach");

    detach_and_delete_volume(
        &cloud, &allocator, &volume_id, &instance_id, &device, &cancel, TICK, &NullSink,
    )
    .await
    .expect("detach and delete");

    assert!(cloud.volume(&volume_id).await.is_none(), "volume deleted");
    assert_eq!(allocator.claimed().await, 0);
}

#[tokio::test]
async fn deleting_an_already_deleted_volume_converges() {
    let cloud = StubEc2::new();
    let allocator = MountPointAllocator::new();
    allocator.reserve("/dev/xvdf").await;
    cloud.fail_on_with_code("detach_volume", VOLUME_NOT_FOUND).await;

    detach_and_delete_volume(
        &cloud,
        &allocator,
        "vol-gone",
        "i-1",
        "/dev/xvdf",
        &CancellationToken::new(),
        TICK,
        &NullSink,
    )
    .await
    .expect("an already-deleted volume counts as deleted");

    assert_eq!(allocator.claimed().await, 0);
}

#[tokio::test]
async fn snapshot_completion_is_awaited_and_publication_is_optional() {
    let cloud = StubEc2::new();
    let volume_id = cloud
        .insert_volume(VolumeDescription {
            state: String::from("in-use"),
            ..VolumeDescription::default()
        })
        .await;
    let cancel = CancellationToken::new();

    let private_id = create_snapshot(
        &cloud, &volume_id, "backup", false, &cancel, TICK, &NullSink,
    )
    .await
    .expect("private snapshot");
    let public_id = create_snapshot(
        &cloud, &volume_id, "release", true, &cancel, TICK, &NullSink,
    )
    .await
    .expect("public snapshot");

    assert!(!cloud.snapshot_is_public(&private_id).await);
    assert!(cloud.snapshot_is_public(&public_id).await);
}

#[tokio::test]
async fn failed_association_releases_the_fresh_address() {
    let cloud = StubEc2::new();
    cloud.fail_on("associate_address").await;

    let err = allocate_and_associate_address(&cloud, "i-1", &NullSink)
        .await
        .expect_err("association should fail");

    assert!(matches!(err, Ec2Error::Api { .. }), "got {err:?}");
    assert!(cloud.held_addresses().await.is_empty(), "no leaked address");
    assert_eq!(cloud.released_addresses().await.len(), 1);
}
