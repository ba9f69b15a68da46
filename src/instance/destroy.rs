//! The teardown sequence behind [`Instance::destroy`].

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use super::{Instance, LifecycleState};
use crate::api::{Ec2Api, TAG_CREATED_BY, VolumeDescription};
use crate::error::Ec2Error;
use crate::lifecycle;
use crate::progress::ProgressSink;

impl<E: Ec2Api + 'static> Instance<E> {
    /// Tears the instance down: deletes the volumes this tool created,
    /// releases the elastic IP when this process allocated it, terminates
    /// the instance, and then deletes each of its security groups and the
    /// key pair — but only those no surviving instance still uses. Volumes with
    /// more than one attachment, or without the creation tag, are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidState`] unless the instance is active, and
    /// [`Ec2Error::Vanished`] when the control plane no longer knows it. On
    /// any failure the orchestrator stays active so destroy can be retried.
    pub async fn destroy(
        &mut self,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        self.require_state(LifecycleState::Active, "destroy the instance")?;
        self.state = LifecycleState::Destroying;
        match self.run_destroy(sink, cancel).await {
            Ok(()) => {
                self.state = LifecycleState::Inert;
                self.instance_id = None;
                self.spot_request_id = None;
                self.public_ip = None;
                self.key_name = None;
                self.availability_zone = None;
                self.volumes.clear();
                sink.log(&format!("Instance '{}' destroyed", self.name));
                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Active;
                Err(err)
            }
        }
    }

    async fn run_destroy(
        &mut self,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        let instance_id = self.instance_id.clone().ok_or_else(|| Ec2Error::InvalidState {
            state: self.state.name().to_owned(),
            operation: String::from("destroy the instance"),
        })?;
        let description = self
            .client
            .describe_instance(&instance_id)
            .await?
            .ok_or_else(|| Ec2Error::Vanished {
                action: format!("destroy instance {instance_id}"),
            })?;
        let key_name = self.key_name.clone().or(description.key_name);
        let mut groups = description.security_groups;
        let derived = self.security_group_name();
        if !groups.contains(&derived) {
            groups.push(derived);
        }

        let attached = self.client.describe_volumes_for_instance(&instance_id).await?;
        let doomed: Vec<(String, String)> = attached
            .iter()
            .filter(|volume| qualifies_for_deletion(volume))
            .filter_map(|volume| {
                volume
                    .attachment_for(&instance_id)
                    .map(|attachment| (volume.id.clone(), attachment.device.clone()))
            })
            .collect();

        if let Some(address) = self.address.take() {
            if let Err(err) = lifecycle::release_address(self.client.as_ref(), &address, sink).await
            {
                self.address = Some(address);
                return Err(err);
            }
        }

        let deletions = doomed.into_iter().map(|(volume_id, device)| {
            let client = Arc::clone(&self.client);
            let allocator = Arc::clone(&self.allocator);
            let instance_id = instance_id.clone();
            let interval = self.poll_interval;
            async move {
                lifecycle::detach_and_delete_volume(
                    client.as_ref(),
                    &allocator,
                    &volume_id,
                    &instance_id,
                    &device,
                    cancel,
                    interval,
                    sink,
                )
                .await
                .map_err(|err| (volume_id, err))
            }
        });
        for outcome in join_all(deletions).await {
            if let Err((volume_id, err)) = outcome {
                sink.log(&format!("Failed to delete volume {volume_id}: {err}"));
                return Err(err);
            }
        }

        lifecycle::terminate_instance(
            self.client.as_ref(),
            &instance_id,
            cancel,
            self.poll_interval,
            sink,
        )
        .await?;

        let survivors = self.client.list_instances().await?;
        for group in &groups {
            if survivors
                .iter()
                .any(|instance| instance.security_groups.iter().any(|name| name == group))
            {
                sink.log(&format!(
                    "Security group {group} is still in use; leaving it"
                ));
            } else {
                lifecycle::delete_security_group(self.client.as_ref(), group, sink).await?;
            }
        }

        if let Some(key) = key_name {
            if survivors
                .iter()
                .any(|instance| instance.key_name.as_deref() == Some(key.as_str()))
            {
                sink.log(&format!("Key pair {key} is still in use; leaving it"));
            } else {
                sink.log(&format!("Deleting key pair {key}"));
                self.client.delete_key_pair(&key).await?;
            }
        }
        Ok(())
    }
}

/// A volume is deleted with its instance only when it is attached to that
/// instance alone and carries the creation tag. Anything else might be
/// shared or foreign.
fn qualifies_for_deletion(volume: &VolumeDescription) -> bool {
    volume.attachments.len() == 1 && volume.tag(TAG_CREATED_BY).is_some()
}
