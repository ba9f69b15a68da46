//! Volume setup, rollback, and teardown tests, driven through the in-memory
//! stub cloud.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::api::{LaunchSpecification, TAG_NAME as NAME_TAG, VolumeAttachment, VolumeDescription};
use crate::guest::{PortRange, Protocol};
use crate::progress::NullSink;
use crate::test_support::{StaticGuest, StubEc2};

const TICK: Duration = Duration::from_millis(1);

struct Fixture {
    cloud: Arc<StubEc2>,
    allocator: Arc<MountPointAllocator>,
    context: AttachmentContext,
}

async fn fixture() -> Fixture {
    let cloud = Arc::new(StubEc2::new());
    cloud.insert_security_group("web-sg").await;
    let launch = LaunchSpecification {
        image_id: String::from("ami-base"),
        size_class: String::from("t2.micro"),
        key_name: String::from("key"),
        security_group: String::from("web-sg"),
        availability_zone: Some(String::from("us-east-1a")),
    };
    let instance_id = cloud
        .run_instance(&launch)
        .await
        .unwrap_or_else(|err| panic!("launch: {err}"));
    Fixture {
        cloud,
        allocator: Arc::new(MountPointAllocator::new()),
        context: AttachmentContext {
            instance_id,
            availability_zone: String::from("us-east-1a"),
            security_group: String::from("web-sg"),
            instance_name: String::from("web-1"),
        },
    }
}

fn volume(fixture: &Fixture, name: &str) -> Volume<StubEc2> {
    Volume::new(
        Arc::clone(&fixture.cloud),
        Arc::clone(&fixture.allocator),
        name,
        TICK,
    )
}

#[rstest]
#[case::snapshot("snap-0123", VolumeSource::Snapshot(String::from("snap-0123")))]
#[case::existing("vol-0123", VolumeSource::Existing(String::from("vol-0123")))]
fn sources_are_classified_by_prefix(#[case] raw: &str, #[case] expected: VolumeSource) {
    assert_eq!(VolumeSource::classify(raw), Ok(expected));
}

#[rstest]
#[case::image("ami-0123")]
#[case::instance("i-0123")]
#[case::blank("")]
fn malformed_sources_are_classified_as_invalid(#[case] raw: &str) {
    let err = VolumeSource::classify(raw).expect_err("must be rejected");
    assert!(matches!(err, Ec2Error::InvalidArgument(_)), "got {err:?}");
}

#[tokio::test]
async fn malformed_sources_are_rejected_before_any_remote_call() {
    let fixture = fixture().await;
    let mut volume = volume(&fixture, "data");
    let calls_before = fixture.cloud.calls().await.len();

    let err = volume
        .setup(
            "ami-not-a-volume",
            &fixture.context,
            &StaticGuest::new(),
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("a malformed source must be rejected");

    assert!(matches!(err, Ec2Error::InvalidArgument(_)), "got {err:?}");
    assert_eq!(fixture.cloud.calls().await.len(), calls_before);
}

#[tokio::test]
async fn snapshot_setup_creates_tags_attaches_and_mounts() {
    let fixture = fixture().await;
    fixture.cloud.insert_snapshot("snap-data").await;
    let guest = StaticGuest::new();
    let mut volume = volume(&fixture, "data");

    volume
        .setup(
            "snap-data",
            &fixture.context,
            &guest,
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("setup: {err}"));

    let volume_id = volume.volume_id().expect("materialised").to_owned();
    let description = fixture.cloud.volume(&volume_id).await.expect("volume");
    assert_eq!(description.tag(NAME_TAG), Some("web-1 - data"));
    assert_eq!(description.tag(TAG_CREATED_BY), Some("true"));
    assert_eq!(description.tag(TAG_VOLUME_NAME), Some("data"));
    assert_eq!(
        description
            .attachment_for(&fixture.context.instance_id)
            .map(|attachment| attachment.device.as_str()),
        Some("/dev/xvdf")
    );
    assert_eq!(volume.device(), Some("/dev/xvdf"));
    assert_eq!(
        guest.mounted(),
        vec![(String::from("/dev/xvdf"), String::from("/mnt/data"))]
    );
}

#[tokio::test]
async fn guest_port_requirements_are_synced_to_the_security_group() {
    let fixture = fixture().await;
    fixture.cloud.insert_snapshot("snap-data").await;
    let guest = StaticGuest::requiring(vec![PortRange {
        from_port: 8080,
        to_port: 8090,
        protocol: Protocol::Tcp,
    }]);
    let mut volume = volume(&fixture, "data");

    volume
        .setup(
            "snap-data",
            &fixture.context,
            &guest,
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("setup: {err}"));

    let rules = fixture.cloud.ingress_rules("web-sg").await;
    assert_eq!(rules.len(), 1);
    assert_eq!(
        rules.first(),
        Some(&IngressRule {
            protocol: String::from("tcp"),
            from_port: 8080,
            to_port: 8090,
        })
    );
}

#[tokio::test]
async fn failed_mount_rolls_back_a_snapshot_restored_volume() {
    let fixture = fixture().await;
    fixture.cloud.insert_snapshot("snap-data").await;
    let mut volume = volume(&fixture, "data");

    let err = volume
        .setup(
            "snap-data",
            &fixture.context,
            &StaticGuest::failing_mounts(),
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("mount failure must fail the setup");

    assert!(matches!(err.root_cause(), Ec2Error::Guest(_)), "got {err:?}");
    assert!(
        fixture.cloud.volume_ids().await.is_empty(),
        "the restored volume must be deleted again"
    );
    assert_eq!(fixture.allocator.claimed().await, 0, "device reclaimed");
    assert!(volume.volume_id().is_none());
}

#[tokio::test]
async fn failed_mount_detaches_but_keeps_an_adopted_volume() {
    let fixture = fixture().await;
    let adopted = fixture
        .cloud
        .insert_volume(VolumeDescription {
            state: String::from("available"),
            ..VolumeDescription::default()
        })
        .await;
    let mut volume = volume(&fixture, "data");

    volume
        .setup(
            &adopted,
            &fixture.context,
            &StaticGuest::failing_mounts(),
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("mount failure must fail the setup");

    let description = fixture
        .cloud
        .volume(&adopted)
        .await
        .expect("an adopted volume is never deleted");
    assert!(description.attachments.is_empty(), "but it is detached");
    assert_eq!(fixture.allocator.claimed().await, 0);
}

#[tokio::test]
async fn volumes_attached_elsewhere_cannot_be_adopted() {
    let fixture = fixture().await;
    let busy = fixture
        .cloud
        .insert_volume(VolumeDescription {
            state: String::from("in-use"),
            attachments: vec![VolumeAttachment {
                instance_id: String::from("i-other"),
                device: String::from("/dev/xvdf"),
                state: String::from("attached"),
            }],
            ..VolumeDescription::default()
        })
        .await;
    let mut volume = volume(&fixture, "data");

    let err = volume
        .setup(
            &busy,
            &fixture.context,
            &StaticGuest::new(),
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("a busy volume must be rejected");

    assert!(
        matches!(err.root_cause(), Ec2Error::InvalidState { .. }),
        "got {err:?}"
    );
    assert_eq!(fixture.cloud.call_count("attach_volume").await, 0);
}

#[tokio::test]
async fn sibling_volumes_get_distinct_devices() {
    let fixture = fixture().await;
    fixture.cloud.insert_snapshot("snap-a").await;
    fixture.cloud.insert_snapshot("snap-b").await;
    let guest = StaticGuest::new();
    let cancel = CancellationToken::new();
    let mut first = volume(&fixture, "a");
    let mut second = volume(&fixture, "b");

    first
        .setup("snap-a", &fixture.context, &guest, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("first setup: {err}"));
    second
        .setup("snap-b", &fixture.context, &guest, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("second setup: {err}"));

    assert_eq!(first.device(), Some("/dev/xvdf"));
    assert_eq!(second.device(), Some("/dev/xvdg"));
}

#[tokio::test]
async fn delete_removes_created_volumes_and_frees_the_device() {
    let fixture = fixture().await;
    fixture.cloud.insert_snapshot("snap-data").await;
    let cancel = CancellationToken::new();
    let mut volume = volume(&fixture, "data");
    volume
        .setup(
            "snap-data",
            &fixture.context,
            &StaticGuest::new(),
            &NullSink,
            &cancel,
        )
        .await
        .unwrap_or_else(|err| panic!("setup: {err}"));

    volume
        .delete(&fixture.context.instance_id, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));

    assert!(fixture.cloud.volume_ids().await.is_empty());
    assert_eq!(fixture.allocator.claimed().await, 0);

    // A handle that holds nothing is a no-op, not an error.
    volume
        .delete(&fixture.context.instance_id, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("repeat delete: {err}"));
}

#[tokio::test]
async fn delete_removes_adopted_volumes_as_well() {
    let fixture = fixture().await;
    let adopted = fixture
        .cloud
        .insert_volume(VolumeDescription {
            state: String::from("available"),
            ..VolumeDescription::default()
        })
        .await;
    let cancel = CancellationToken::new();
    let mut volume = volume(&fixture, "data");
    volume
        .setup(
            &adopted,
            &fixture.context,
            &StaticGuest::new(),
            &NullSink,
            &cancel,
        )
        .await
        .unwrap_or_else(|err| panic!("setup: {err}"));

    volume
        .delete(&fixture.context.instance_id, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));

    // Deletion is unconditional; only a setup rollback spares adopted volumes.
    assert!(fixture.cloud.volume(&adopted).await.is_none());
    assert_eq!(fixture.allocator.claimed().await, 0);
}

#[tokio::test]
async fn snapshots_can_be_taken_and_published() {
    let fixture = fixture().await;
    fixture.cloud.insert_snapshot("snap-data").await;
    let cancel = CancellationToken::new();
    let mut volume = volume(&fixture, "data");
    volume
        .setup(
            "snap-data",
            &fixture.context,
            &StaticGuest::new(),
            &NullSink,
            &cancel,
        )
        .await
        .unwrap_or_else(|err| panic!("setup: {err}"));

    let snapshot_id = volume
        .create_snapshot("data backup", true, &NullSink, &cancel)
        .await
        .unwrap_or_else(|err| panic!("snapshot: {err}"));

    assert!(fixture.cloud.snapshot_is_public(&snapshot_id).await);
}
