//! End-to-end lifecycle tests driven through the public API against the
//! in-memory stub cloud.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ec2_manager::test_support::{MemoryKeyStore, RecordingSink, StaticGuest, StubEc2};
use ec2_manager::{Instance, InstanceSpecification, NullSink};

const TICK: Duration = Duration::from_millis(1);

fn spec() -> InstanceSpecification {
    InstanceSpecification {
        image_id: String::from("ami-base"),
        size_class: String::from("t2.micro"),
        availability_zone: Some(String::from("us-east-1a")),
        spot_bid_price: None,
    }
}

fn orchestrator(cloud: &Arc<StubEc2>, name: &str) -> Instance<StubEc2> {
    Instance::new(Arc::clone(cloud), name, spec()).with_poll_interval(TICK)
}

#[tokio::test]
async fn a_full_session_leaves_only_the_snapshot_behind() {
    let cloud = Arc::new(StubEc2::new());
    cloud.insert_snapshot("snap-base").await;
    let keys = MemoryKeyStore::new();
    let guest = StaticGuest::new();
    let cancel = CancellationToken::new();
    let mut instance = orchestrator(&cloud, "web");

    instance
        .create(&keys, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    instance
        .mount_volume("data", "snap-base", &guest, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));
    let backup = instance
        .snapshot_volume("data", "data backup", false, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("snapshot: {err}"));

    instance
        .destroy(&NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    assert!(cloud.security_group_names().await.is_empty());
    assert!(cloud.key_pair_names().await.is_empty());
    assert!(cloud.held_addresses().await.is_empty());
    assert!(cloud.volume_ids().await.is_empty());
    assert!(
        cloud.snapshot_ids().await.contains(&backup),
        "snapshots outlive the instance"
    );
    assert!(!instance.is_active());
}

#[tokio::test]
async fn a_second_session_can_adopt_and_destroy_by_tag() {
    let cloud = Arc::new(StubEc2::new());
    let keys = MemoryKeyStore::new();
    let cancel = CancellationToken::new();
    let mut first = orchestrator(&cloud, "web");
    first
        .create(&keys, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    // A fresh process finds the instance through its tags alone.
    let managed = Instance::list_managed(cloud.as_ref())
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    let description = managed
        .iter()
        .find(|candidate| candidate.tag("Name") == Some("web"))
        .unwrap_or_else(|| panic!("the instance must be listed"));

    let mut adopted = Instance::reconnect(Arc::clone(&cloud), description, spec())
        .await
        .unwrap_or_else(|err| panic!("reconnect: {err}"))
        .with_poll_interval(TICK);
    adopted
        .destroy(&NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    assert!(cloud.security_group_names().await.is_empty());
    assert!(
        Instance::list_managed(cloud.as_ref())
            .await
            .unwrap_or_else(|err| panic!("list: {err}"))
            .is_empty()
    );
}

#[tokio::test]
async fn progress_reaches_the_sink() {
    let cloud = Arc::new(StubEc2::new());
    let keys = MemoryKeyStore::new();
    let sink = RecordingSink::new();
    let mut instance = orchestrator(&cloud, "web");

    instance
        .create(&keys, &sink, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert!(sink.contains("Instance 'web' is ready at"), "{:?}", sink.lines());
}
