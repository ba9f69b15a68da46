//! The provisioning sequence behind [`Instance::create`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{CREATED_BY_VALUE, Instance, LifecycleState, guard};
use crate::api::{Ec2Api, IngressRule, LaunchSpecification, TAG_CREATED_BY, TAG_NAME,
    TAG_UNIQUE_KEY};
use crate::error::Ec2Error;
use crate::keys::KeyStore;
use crate::lifecycle;
use crate::poll::{Observation, poll_until};
use crate::progress::{NullSink, ProgressSink};
use crate::saga::Saga;

impl<E: Ec2Api + 'static> Instance<E> {
    /// Provisions the instance and everything around it: security group with
    /// shell and ping ingress, key pair, the instance itself (on-demand or
    /// through a spot bid), correlation tags, and an elastic IP.
    ///
    /// The sequence is transactional. On any failure — including a
    /// cancellation observed mid-sequence — every step that had completed is
    /// compensated in reverse order, and the orchestrator returns to its
    /// inert state so a later retry starts clean.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidState`] unless the orchestrator is inert.
    /// Otherwise returns the error that stopped the sequence; when
    /// compensation itself also failed the error is annotated with the
    /// failed rollback steps, never replaced by them.
    pub async fn create(
        &mut self,
        key_store: &dyn KeyStore,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        self.require_state(LifecycleState::Inert, "create the instance")?;
        self.state = LifecycleState::Creating;
        let mut saga = Saga::new();
        match self.provision(key_store, sink, cancel, &mut saga).await {
            Ok(()) => {
                self.state = LifecycleState::Active;
                sink.log(&format!(
                    "Instance '{}' is ready at {}",
                    self.name,
                    self.public_ip().unwrap_or("<no address>")
                ));
                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Inert;
                sink.log(&format!("Creation of '{}' failed: {err}", self.name));
                let failures = saga.unwind(sink).await;
                self.instance_id = None;
                self.spot_request_id = None;
                self.address = None;
                self.public_ip = None;
                self.availability_zone = None;
                self.key_name = None;
                self.private_key = None;
                Err(err.with_rollback_failures(failures))
            }
        }
    }

    async fn provision(
        &mut self,
        key_store: &dyn KeyStore,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        saga: &mut Saga,
    ) -> Result<(), Ec2Error> {
        let group = self.security_group_name();
        guard(cancel, "create security group")?;
        lifecycle::create_security_group(
            self.client.as_ref(),
            &group,
            &format!("Instance {} ({})", self.name, self.unique_key),
            sink,
        )
        .await?;
        {
            let client = Arc::clone(&self.client);
            let group = group.clone();
            saga.push(format!("delete security group {group}"), move || {
                Box::pin(async move {
                    lifecycle::delete_security_group(client.as_ref(), &group, &NullSink).await
                })
            });
        }

        guard(cancel, "authorize ingress")?;
        lifecycle::authorize_ingress(
            self.client.as_ref(),
            &group,
            &[IngressRule::tcp(22), IngressRule::all_icmp()],
            sink,
        )
        .await?;

        guard(cancel, "prepare key pair")?;
        let key = lifecycle::create_or_reuse_key_pair(self.client.as_ref(), key_store, sink).await?;
        self.key_name = Some(key.name.clone());
        self.private_key = Some(key.material);

        let launch = LaunchSpecification {
            image_id: self.spec.image_id.clone(),
            size_class: self.spec.size_class.clone(),
            key_name: key.name,
            security_group: group,
            availability_zone: self.spec.availability_zone.clone(),
        };
        let instance_id = match self.spec.spot_bid_price.clone() {
            Some(bid) => self.launch_spot(&bid, &launch, sink, cancel, saga).await?,
            None => self.launch_on_demand(&launch, sink, cancel, saga).await?,
        };
        self.instance_id = Some(instance_id.clone());

        guard(cancel, "tag instance")?;
        self.client
            .create_tags(
                &instance_id,
                &[
                    (TAG_CREATED_BY.to_owned(), CREATED_BY_VALUE.to_owned()),
                    (TAG_NAME.to_owned(), self.name.clone()),
                    (TAG_UNIQUE_KEY.to_owned(), self.unique_key.clone()),
                ],
            )
            .await?;

        self.await_boot(&instance_id, sink, cancel).await?;

        guard(cancel, "associate elastic IP")?;
        let address =
            lifecycle::allocate_and_associate_address(self.client.as_ref(), &instance_id, sink)
                .await?;
        {
            let client = Arc::clone(&self.client);
            let held = address.clone();
            saga.push(
                format!("release elastic IP {}", address.public_ip),
                move || {
                    Box::pin(async move {
                        lifecycle::release_address(client.as_ref(), &held, &NullSink).await
                    })
                },
            );
        }
        self.public_ip = Some(address.public_ip.clone());
        self.address = Some(address);

        if self.availability_zone.is_none()
            && let Some(description) = self.client.describe_instance(&instance_id).await?
        {
            self.availability_zone = description.availability_zone;
        }
        if self.availability_zone.is_none() {
            self.availability_zone = self.spec.availability_zone.clone();
        }
        Ok(())
    }

    async fn launch_on_demand(
        &self,
        launch: &LaunchSpecification,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        saga: &mut Saga,
    ) -> Result<String, Ec2Error> {
        guard(cancel, "launch instance")?;
        sink.log(&format!(
            "Launching on-demand {} instance of {}",
            launch.size_class, launch.image_id
        ));
        let instance_id = self.client.run_instance(launch).await?;
        let client = Arc::clone(&self.client);
        let id = instance_id.clone();
        let interval = self.poll_interval;
        saga.push(format!("terminate instance {instance_id}"), move || {
            Box::pin(async move {
                lifecycle::terminate_instance(
                    client.as_ref(),
                    &id,
                    &CancellationToken::new(),
                    interval,
                    &NullSink,
                )
                .await
            })
        });
        Ok(instance_id)
    }

    async fn launch_spot(
        &mut self,
        bid: &str,
        launch: &LaunchSpecification,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        saga: &mut Saga,
    ) -> Result<String, Ec2Error> {
        guard(cancel, "submit spot bid")?;
        sink.log(&format!(
            "Bidding {bid}/hour for a spot {} instance of {}",
            launch.size_class, launch.image_id
        ));
        let request_id = self.client.request_spot_instance(bid, launch).await?;
        self.spot_request_id = Some(request_id.clone());
        {
            // The bid is cancelled before any produced instance is looked
            // up, so fulfilment cannot race the cleanup and leak an
            // instance.
            let client = Arc::clone(&self.client);
            let request = request_id.clone();
            let interval = self.poll_interval;
            saga.push(format!("cancel spot request {request_id}"), move || {
                Box::pin(async move {
                    client.cancel_spot_request(&request).await?;
                    let description = client.describe_spot_request(&request).await?;
                    if let Some(instance_id) = description.instance_id {
                        lifecycle::terminate_instance(
                            client.as_ref(),
                            &instance_id,
                            &CancellationToken::new(),
                            interval,
                            &NullSink,
                        )
                        .await?;
                    }
                    Ok(())
                })
            });
        }
        self.await_spot_fulfilment(&request_id, cancel).await
    }

    async fn await_spot_fulfilment(
        &self,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Ec2Error> {
        let client = self.client.as_ref();
        let action = format!("spot request {request_id} to be fulfilled");
        poll_until(
            &action,
            || async move {
                let description = client.describe_spot_request(request_id).await?;
                match description.state.as_str() {
                    "closed" | "cancelled" | "failed" => Err(Ec2Error::InvalidState {
                        state: description.state,
                        operation: format!("fulfil spot request {request_id}"),
                    }),
                    _ => Ok(Observation::State(description.state)),
                }
            },
            "active",
            cancel,
            self.poll_interval,
            None,
        )
        .await?;
        let description = self.client.describe_spot_request(request_id).await?;
        description.instance_id.ok_or_else(|| Ec2Error::Api {
            action: String::from("describe_spot_request"),
            code: None,
            message: format!("spot request {request_id} is active but reported no instance"),
        })
    }

    /// Waits for the instance to boot. A boot that exceeds the configured
    /// bound gets exactly one reboot, then an unbounded wait; stuck
    /// hypervisor launches usually recover on a restart.
    async fn await_boot(
        &self,
        instance_id: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        sink.log(&format!("Waiting for instance {instance_id} to boot"));
        let first_wait = lifecycle::wait_for_instance_state(
            self.client.as_ref(),
            instance_id,
            "running",
            cancel,
            self.poll_interval,
            Some(self.boot_timeout),
        )
        .await;
        match first_wait {
            Err(Ec2Error::Timeout { .. }) => {
                sink.log(&format!(
                    "Instance {instance_id} is slow to boot; rebooting it once"
                ));
                self.client.reboot_instance(instance_id).await?;
                lifecycle::wait_for_instance_state(
                    self.client.as_ref(),
                    instance_id,
                    "running",
                    cancel,
                    self.poll_interval,
                    None,
                )
                .await
            }
            other => other,
        }
    }
}
