//! Resource lifecycle primitives.
//!
//! Each primitive wraps one asynchronous-completion control-plane mutation
//! with the waiting, idempotency, and cleanup behaviour the orchestrators
//! rely on. Primitives are deliberately free functions over the client
//! adapter so the instance and volume orchestrators can share them.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{Ec2Api, ElasticAddress, IngressRule, TAG_NAME};
use crate::error::{DUPLICATE_PERMISSION, Ec2Error, GROUP_NOT_FOUND, VOLUME_NOT_FOUND};
use crate::keys::{KeyStore, StoredKey};
use crate::mount::MountPointAllocator;
use crate::poll::{Observation, poll_until};
use crate::progress::ProgressSink;

#[cfg(test)]
mod tests;

/// A key pair usable for launching instances, together with the private
/// material needed to reach them afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPairHandle {
    /// Cloud-side key pair name.
    pub name: String,
    /// PEM-encoded private key material.
    pub material: String,
}

/// Creates a security group.
///
/// # Errors
///
/// Propagates any API failure, including a name collision.
pub async fn create_security_group<E: Ec2Api + ?Sized>(
    client: &E,
    name: &str,
    description: &str,
    sink: &dyn ProgressSink,
) -> Result<String, Ec2Error> {
    sink.log(&format!("Creating security group {name}"));
    client.create_security_group(name, description).await
}

/// Deletes a security group. A group that no longer exists counts as
/// deleted, so retried rollbacks converge instead of failing.
///
/// # Errors
///
/// Propagates any API failure other than the group already being gone.
pub async fn delete_security_group<E: Ec2Api + ?Sized>(
    client: &E,
    name: &str,
    sink: &dyn ProgressSink,
) -> Result<(), Ec2Error> {
    sink.log(&format!("Deleting security group {name}"));
    match client.delete_security_group(name).await {
        Err(err) if err.is_code(GROUP_NOT_FOUND) => Ok(()),
        other => other,
    }
}

/// Adds ingress rules to a security group. An empty rule list is a no-op
/// that performs no remote call; rules that already exist are tolerated.
///
/// # Errors
///
/// Propagates any API failure other than a duplicate-rule rejection.
pub async fn authorize_ingress<E: Ec2Api + ?Sized>(
    client: &E,
    group: &str,
    rules: &[IngressRule],
    sink: &dyn ProgressSink,
) -> Result<(), Ec2Error> {
    if rules.is_empty() {
        return Ok(());
    }
    sink.log(&format!(
        "Authorizing {} ingress rule(s) on {group}",
        rules.len()
    ));
    match client.authorize_ingress(group, rules).await {
        Err(err) if err.is_code(DUPLICATE_PERMISSION) => Ok(()),
        other => other,
    }
}

/// Returns a key pair to launch with, reusing the locally stored private key
/// whenever the cloud still knows a key pair with the matching fingerprint.
/// Otherwise a fresh key pair is created under a collision-free name and its
/// material persisted before the name is returned.
///
/// # Errors
///
/// Propagates key-store and API failures. A launch must not proceed with a
/// key whose material was never persisted, so a failed save aborts.
pub async fn create_or_reuse_key_pair<E: Ec2Api + ?Sized>(
    client: &E,
    store: &dyn KeyStore,
    sink: &dyn ProgressSink,
) -> Result<KeyPairHandle, Ec2Error> {
    if let Some(stored) = store.load_key()? {
        if let Some(name) = client
            .find_key_pair_by_fingerprint(&stored.fingerprint)
            .await?
        {
            sink.log(&format!("Reusing key pair {name}"));
            return Ok(KeyPairHandle {
                name,
                material: stored.material,
            });
        }
        sink.log("Stored key no longer matches any cloud key pair; creating a new one");
    }

    let name = format!("ec2manager-{}", Uuid::new_v4().simple());
    sink.log(&format!("Creating key pair {name}"));
    let created = client.create_key_pair(&name).await?;
    store.save_key(&StoredKey {
        material: created.material.clone(),
        fingerprint: created.fingerprint,
    })?;
    Ok(KeyPairHandle {
        name: created.name,
        material: created.material,
    })
}

/// Waits for an instance to report `desired`.
///
/// # Errors
///
/// Propagates poller outcomes: cancellation, timeout, a vanished instance,
/// or a describe failure.
pub async fn wait_for_instance_state<E: Ec2Api + ?Sized>(
    client: &E,
    instance_id: &str,
    desired: &str,
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<(), Ec2Error> {
    let action = format!("instance {instance_id} to be {desired}");
    poll_until(
        &action,
        || async move {
            Ok(client
                .describe_instance(instance_id)
                .await?
                .map_or(Observation::Missing, |description| {
                    Observation::State(description.state)
                }))
        },
        desired,
        cancel,
        interval,
        timeout,
    )
    .await
}

/// Terminates an instance and waits until the control plane reports it
/// terminated. An instance the control plane no longer describes counts as
/// terminated.
///
/// # Errors
///
/// Propagates the termination request failure or a poller outcome.
pub async fn terminate_instance<E: Ec2Api + ?Sized>(
    client: &E,
    instance_id: &str,
    cancel: &CancellationToken,
    interval: Duration,
    sink: &dyn ProgressSink,
) -> Result<(), Ec2Error> {
    sink.log(&format!("Terminating instance {instance_id}"));
    client.terminate_instance(instance_id).await?;
    let action = format!("instance {instance_id} to terminate");
    poll_until(
        &action,
        || async move {
            Ok(client.describe_instance(instance_id).await?.map_or_else(
                || Observation::State(String::from("terminated")),
                |description| Observation::State(description.state),
            ))
        },
        "terminated",
        cancel,
        interval,
        None,
    )
    .await
}

/// Allocates an elastic IP and associates it with an instance. The address
/// is released again if the association fails, so a failed call never leaks
/// an allocation.
///
/// # Errors
///
/// Propagates the allocation or association failure.
pub async fn allocate_and_associate_address<E: Ec2Api + ?Sized>(
    client: &E,
    instance_id: &str,
    sink: &dyn ProgressSink,
) -> Result<ElasticAddress, Ec2Error> {
    let address = client.allocate_address().await?;
    sink.log(&format!(
        "Associating elastic IP {} with {instance_id}",
        address.public_ip
    ));
    if let Err(err) = client.associate_address(instance_id, &address).await {
        let released = release_address(client, &address, sink).await;
        return Err(match released {
            Ok(()) => err,
            Err(release_err) => err.with_rollback_failures(vec![(
                format!("release elastic IP {}", address.public_ip),
                release_err,
            )]),
        });
    }
    Ok(address)
}

/// Disassociates and releases an elastic IP.
///
/// # Errors
///
/// Propagates the first API failure.
pub async fn release_address<E: Ec2Api + ?Sized>(
    client: &E,
    address: &ElasticAddress,
    sink: &dyn ProgressSink,
) -> Result<(), Ec2Error> {
    sink.log(&format!("Releasing elastic IP {}", address.public_ip));
    client.disassociate_address(address).await?;
    client.release_address(address).await
}

/// Materialises a volume from a snapshot and waits for it to become
/// available.
///
/// # Errors
///
/// Propagates the creation failure or a poller outcome.
pub async fn create_volume_from_snapshot<E: Ec2Api + ?Sized>(
    client: &E,
    snapshot_id: &str,
    availability_zone: &str,
    cancel: &CancellationToken,
    interval: Duration,
    sink: &dyn ProgressSink,
) -> Result<String, Ec2Error> {
    sink.log(&format!("Creating volume from snapshot {snapshot_id}"));
    let volume_id = client
        .create_volume_from_snapshot(snapshot_id, availability_zone)
        .await?;
    wait_for_volume_state(client, &volume_id, "available", cancel, interval).await?;
    Ok(volume_id)
}

/// Waits for a volume to report `desired`.
///
/// # Errors
///
/// Propagates poller outcomes.
pub async fn wait_for_volume_state<E: Ec2Api + ?Sized>(
    client: &E,
    volume_id: &str,
    desired: &str,
    cancel: &CancellationToken,
    interval: Duration,
) -> Result<(), Ec2Error> {
    let action = format!("volume {volume_id} to be {desired}");
    poll_until(
        &action,
        || async move {
            Ok(client
                .describe_volume(volume_id)
                .await?
                .map_or(Observation::Missing, |description| {
                    Observation::State(description.state)
                }))
        },
        desired,
        cancel,
        interval,
        None,
    )
    .await
}

/// Attaches a volume to an instance, claiming a device name from the
/// instance's pool and waiting for the attachment to complete. The device
/// name is returned to the pool when the attachment fails.
///
/// # Errors
///
/// Propagates pool exhaustion, the attach failure, or a poller outcome.
pub async fn attach_volume<E: Ec2Api + ?Sized>(
    client: &E,
    allocator: &MountPointAllocator,
    volume_id: &str,
    instance_id: &str,
    cancel: &CancellationToken,
    interval: Duration,
    sink: &dyn ProgressSink,
) -> Result<String, Ec2Error> {
    let device = allocator.allocate().await?;
    sink.log(&format!(
        "Attaching volume {volume_id} to {instance_id} at {device}"
    ));
    let attached = attach_at(client, volume_id, instance_id, &device, cancel, interval).await;
    if let Err(err) = attached {
        allocator.release(&device).await;
        return Err(err);
    }
    Ok(device)
}

async fn attach_at<E: Ec2Api + ?Sized>(
    client: &E,
    volume_id: &str,
    instance_id: &str,
    device: &str,
    cancel: &CancellationToken,
    interval: Duration,
) -> Result<(), Ec2Error> {
    client.attach_volume(volume_id, instance_id, device).await?;
    let action = format!("volume {volume_id} to attach to {instance_id}");
    poll_until(
        &action,
        || async move {
            Ok(client
                .describe_volume(volume_id)
                .await?
                .map_or(Observation::Missing, |description| {
                    description.attachment_for(instance_id).map_or(
                        Observation::State(String::from("detached")),
                        |attachment| Observation::State(attachment.state.clone()),
                    )
                }))
        },
        "attached",
        cancel,
        interval,
        None,
    )
    .await
}

/// Detaches a volume, waits for it to become available, and deletes it.
/// A volume the control plane no longer knows counts as deleted. The device
/// name is returned to the instance's pool on success.
///
/// # Errors
///
/// Propagates the detach, wait, or delete failure.
pub async fn detach_and_delete_volume<E: Ec2Api + ?Sized>(
    client: &E,
    allocator: &MountPointAllocator,
    volume_id: &str,
    instance_id: &str,
    device: &str,
    cancel: &CancellationToken,
    interval: Duration,
    sink: &dyn ProgressSink,
) -> Result<(), Ec2Error> {
    sink.log(&format!("Detaching volume {volume_id} from {instance_id}"));
    match client.detach_volume(volume_id, instance_id).await {
        Err(err) if err.is_code(VOLUME_NOT_FOUND) => {
            allocator.release(device).await;
            return Ok(());
        }
        Err(err) => return Err(err),
        Ok(()) => {}
    }
    let action = format!("volume {volume_id} to detach");
    poll_until(
        &action,
        || async move {
            // A volume that disappears mid-detach has simply been deleted
            // already; treat it as detached rather than vanished.
            Ok(client.describe_volume(volume_id).await?.map_or_else(
                || Observation::State(String::from("available")),
                |description| Observation::State(description.state),
            ))
        },
        "available",
        cancel,
        interval,
        None,
    )
    .await?;
    sink.log(&format!("Deleting volume {volume_id}"));
    match client.delete_volume(volume_id).await {
        Err(err) if err.is_code(VOLUME_NOT_FOUND) => {}
        Err(err) => return Err(err),
        Ok(()) => {}
    }
    allocator.release(device).await;
    Ok(())
}

/// Snapshots a volume, waits for completion, names the snapshot, and
/// optionally opens it to every account.
///
/// # Errors
///
/// Propagates the snapshot request failure or a poller outcome.
pub async fn create_snapshot<E: Ec2Api + ?Sized>(
    client: &E,
    volume_id: &str,
    name: &str,
    public: bool,
    cancel: &CancellationToken,
    interval: Duration,
    sink: &dyn ProgressSink,
) -> Result<String, Ec2Error> {
    sink.log(&format!("Snapshotting volume {volume_id} as '{name}'"));
    let snapshot_id = client.create_snapshot(volume_id, name).await?;
    let snapshot_ref = snapshot_id.as_str();
    let action = format!("snapshot {snapshot_id} to complete");
    poll_until(
        &action,
        || async move {
            Ok(client
                .describe_snapshot(snapshot_ref)
                .await?
                .map_or(Observation::Missing, |description| {
                    Observation::State(description.state)
                }))
        },
        "completed",
        cancel,
        interval,
        None,
    )
    .await?;
    client
        .create_tags(&snapshot_id, &[(TAG_NAME.to_owned(), name.to_owned())])
        .await?;
    if public {
        sink.log(&format!("Making snapshot {snapshot_id} public"));
        client.make_snapshot_public(&snapshot_id).await?;
    }
    Ok(snapshot_id)
}
