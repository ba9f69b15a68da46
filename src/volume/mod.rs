//! Volume orchestration.
//!
//! A [`Volume`] binds one EBS volume to one instance: it materialises the
//! volume (from a snapshot, or adopts an existing one), attaches it at a
//! device name from the instance's pool, drives guest-side mounting, and
//! keeps the instance's security group in sync with the ports the mounted
//! workload requires. Setup is transactional: a failure detaches and, for
//! volumes this process created, deletes again before the error surfaces.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{Ec2Api, IngressRule, TAG_CREATED_BY, TAG_NAME, TAG_VOLUME_NAME};
use crate::error::Ec2Error;
use crate::guest::GuestConfigurator;
use crate::lifecycle;
use crate::mount::MountPointAllocator;
use crate::progress::ProgressSink;

#[cfg(test)]
mod tests;

/// Where a volume comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeSource {
    /// Restore a fresh volume from this snapshot.
    Snapshot(String),
    /// Adopt this already-existing volume.
    Existing(String),
}

impl VolumeSource {
    /// Classifies a raw identifier by its prefix. Rejecting malformed
    /// identifiers here keeps a typo from reaching the control plane at all.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidArgument`] for identifiers that are neither
    /// snapshot nor volume ids.
    pub fn classify(raw: &str) -> Result<Self, Ec2Error> {
        if raw.starts_with("snap-") {
            Ok(Self::Snapshot(raw.to_owned()))
        } else if raw.starts_with("vol-") {
            Ok(Self::Existing(raw.to_owned()))
        } else {
            Err(Ec2Error::InvalidArgument(format!(
                "'{raw}' is neither a snapshot id (snap-...) nor a volume id (vol-...)"
            )))
        }
    }
}

/// Placement and naming details a volume needs from its instance.
#[derive(Clone, Debug)]
pub struct AttachmentContext {
    /// Instance the volume attaches to.
    pub instance_id: String,
    /// Zone volumes must be created in to be attachable.
    pub availability_zone: String,
    /// Security group to keep in sync with guest port requirements.
    pub security_group: String,
    /// Instance display name, used as the prefix of volume display names.
    pub instance_name: String,
}

/// One volume bound to one instance.
pub struct Volume<E: Ec2Api + 'static> {
    client: Arc<E>,
    allocator: Arc<MountPointAllocator>,
    name: String,
    mount_point: String,
    volume_id: Option<String>,
    device: Option<String>,
    created_by_setup: bool,
    poll_interval: Duration,
}

impl<E: Ec2Api + 'static> Volume<E> {
    /// Creates an unattached volume handle named `name`, mounted in the guest
    /// at `/mnt/<name>`.
    #[must_use]
    pub fn new(
        client: Arc<E>,
        allocator: Arc<MountPointAllocator>,
        name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let name = name.into();
        let mount_point = format!("/mnt/{name}");
        Self {
            client,
            allocator,
            name,
            mount_point,
            volume_id: None,
            device: None,
            created_by_setup: false,
            poll_interval,
        }
    }

    /// Logical name of the volume.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guest path the volume is mounted at.
    #[must_use]
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Cloud identifier, once the volume is materialised.
    #[must_use]
    pub fn volume_id(&self) -> Option<&str> {
        self.volume_id.as_deref()
    }

    /// Device name the volume is attached at, once attached.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Marks this handle as describing a volume found already attached, used
    /// when reconnecting to a running instance.
    pub(crate) fn adopt_attached(&mut self, volume_id: String, device: String) {
        self.volume_id = Some(volume_id);
        self.device = Some(device);
        self.created_by_setup = false;
    }

    /// Materialises, attaches, and mounts the volume, then opens the ports
    /// the mounted workload requires.
    ///
    /// On failure every completed step is undone (a volume adopted from
    /// `vol-...` is detached but never deleted) and the triggering error is
    /// returned, annotated if the rollback itself also failed.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidArgument`] for a malformed source,
    /// [`Ec2Error::InvalidState`] when adopting a volume that is attached
    /// elsewhere, and otherwise propagates API, guest, and poller failures.
    pub async fn setup(
        &mut self,
        source: &str,
        context: &AttachmentContext,
        guest: &dyn GuestConfigurator,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        let source = VolumeSource::classify(source)?;
        if self.volume_id.is_some() {
            return Err(Ec2Error::InvalidState {
                state: String::from("attached"),
                operation: format!("set up volume '{}'", self.name),
            });
        }
        match self.run_setup(&source, context, guest, sink, cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                sink.log(&format!(
                    "Setup of volume '{}' failed; undoing partial work",
                    self.name
                ));
                let failures = self.rollback_setup(context, sink).await;
                Err(err.with_rollback_failures(failures))
            }
        }
    }

    async fn run_setup(
        &mut self,
        source: &VolumeSource,
        context: &AttachmentContext,
        guest: &dyn GuestConfigurator,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        let volume_id = match source {
            VolumeSource::Snapshot(snapshot_id) => {
                let volume_id = lifecycle::create_volume_from_snapshot(
                    self.client.as_ref(),
                    snapshot_id,
                    &context.availability_zone,
                    cancel,
                    self.poll_interval,
                    sink,
                )
                .await?;
                self.created_by_setup = true;
                self.client
                    .create_tags(
                        &volume_id,
                        &[
                            (
                                TAG_NAME.to_owned(),
                                format!("{} - {}", context.instance_name, self.name),
                            ),
                            (TAG_CREATED_BY.to_owned(), String::from("true")),
                            (TAG_VOLUME_NAME.to_owned(), self.name.clone()),
                        ],
                    )
                    .await?;
                volume_id
            }
            VolumeSource::Existing(volume_id) => {
                let description = self
                    .client
                    .describe_volume(volume_id)
                    .await?
                    .ok_or_else(|| {
                        Ec2Error::InvalidArgument(format!("volume {volume_id} does not exist"))
                    })?;
                if !description.attachments.is_empty() {
                    return Err(Ec2Error::InvalidState {
                        state: String::from("in-use"),
                        operation: format!("adopt volume {volume_id}"),
                    });
                }
                volume_id.clone()
            }
        };
        self.volume_id = Some(volume_id.clone());

        let device = lifecycle::attach_volume(
            self.client.as_ref(),
            &self.allocator,
            &volume_id,
            &context.instance_id,
            cancel,
            self.poll_interval,
            sink,
        )
        .await?;
        self.device = Some(device.clone());

        sink.log(&format!(
            "Mounting {device} at {} on {}",
            self.mount_point, context.instance_id
        ));
        guest
            .mount_and_setup_device(&device, &self.mount_point)
            .await?;

        let ports = guest.required_ingress_ports(&self.mount_point).await?;
        let rules: Vec<IngressRule> = ports.into_iter().map(IngressRule::from).collect();
        lifecycle::authorize_ingress(self.client.as_ref(), &context.security_group, &rules, sink)
            .await
    }

    /// Undoes whatever `run_setup` managed to do. Runs under a fresh
    /// cancellation token so an aborted setup still cleans up.
    async fn rollback_setup(
        &mut self,
        context: &AttachmentContext,
        sink: &dyn ProgressSink,
    ) -> Vec<(String, Ec2Error)> {
        let cancel = CancellationToken::new();
        let mut failures = Vec::new();
        let Some(volume_id) = self.volume_id.take() else {
            return failures;
        };

        if let Some(device) = self.device.take() {
            if self.created_by_setup {
                if let Err(err) = lifecycle::detach_and_delete_volume(
                    self.client.as_ref(),
                    &self.allocator,
                    &volume_id,
                    &context.instance_id,
                    &device,
                    &cancel,
                    self.poll_interval,
                    sink,
                )
                .await
                {
                    failures.push((format!("detach and delete volume {volume_id}"), err));
                }
            } else {
                if let Err(err) =
                    self.detach_only(&volume_id, &context.instance_id, &cancel, sink).await
                {
                    failures.push((format!("detach volume {volume_id}"), err));
                }
                self.allocator.release(&device).await;
            }
        } else if self.created_by_setup {
            if let Err(err) = self.client.delete_volume(&volume_id).await {
                failures.push((format!("delete volume {volume_id}"), err));
            }
        }
        self.created_by_setup = false;
        failures
    }

    async fn detach_only(
        &self,
        volume_id: &str,
        instance_id: &str,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<(), Ec2Error> {
        sink.log(&format!("Detaching volume {volume_id} from {instance_id}"));
        self.client.detach_volume(volume_id, instance_id).await?;
        lifecycle::wait_for_volume_state(
            self.client.as_ref(),
            volume_id,
            "available",
            cancel,
            self.poll_interval,
        )
        .await
    }

    /// Detaches the volume and deletes it from the cloud, regardless of
    /// whether this process created or adopted it. A handle that never
    /// materialised a volume is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates detach, wait, and delete failures.
    pub async fn delete(
        &mut self,
        instance_id: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        let Some(volume_id) = self.volume_id.clone() else {
            return Ok(());
        };
        if let Some(device) = self.device.clone() {
            lifecycle::detach_and_delete_volume(
                self.client.as_ref(),
                &self.allocator,
                &volume_id,
                instance_id,
                &device,
                cancel,
                self.poll_interval,
                sink,
            )
            .await?;
        } else {
            self.client.delete_volume(&volume_id).await?;
        }
        self.volume_id = None;
        self.device = None;
        self.created_by_setup = false;
        Ok(())
    }

    /// Snapshots the volume under `name`, optionally opening the snapshot to
    /// every account, and returns the snapshot identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidState`] when the volume has not been
    /// materialised, and otherwise propagates API and poller failures.
    pub async fn create_snapshot(
        &self,
        name: &str,
        public: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<String, Ec2Error> {
        let Some(volume_id) = self.volume_id.as_deref() else {
            return Err(Ec2Error::InvalidState {
                state: String::from("unmaterialised"),
                operation: format!("snapshot volume '{}'", self.name),
            });
        };
        lifecycle::create_snapshot(
            self.client.as_ref(),
            volume_id,
            name,
            public,
            cancel,
            self.poll_interval,
            sink,
        )
        .await
    }
}
