//! Instance orchestration.
//!
//! An [`Instance`] owns the resource graph around one EC2 instance: security
//! group, key pair, the instance itself (on-demand or via a spot bid), an
//! elastic IP, and any mounted volumes. Creation is transactional — each
//! provisioning step registers a compensating action, and a failure or a
//! cancellation unwinds every step that had completed. Destruction deletes
//! only what no other instance still uses.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{Ec2Api, ElasticAddress, InstanceDescription, TAG_CREATED_BY, TAG_UNIQUE_KEY,
    TAG_VOLUME_NAME};
use crate::error::Ec2Error;
use crate::guest::GuestConfigurator;
use crate::mount::MountPointAllocator;
use crate::progress::ProgressSink;
use crate::volume::{AttachmentContext, Volume};

mod create;
mod destroy;

/// Default pause between remote state queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default bound on the initial boot wait before remediation kicks in.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(45);

/// Tag value marking resources created by this tool.
const CREATED_BY_VALUE: &str = "true";

/// What to launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpecification {
    /// Machine image to boot.
    pub image_id: String,
    /// Instance size class (for example `t2.micro`).
    pub size_class: String,
    /// Zone to pin placement to; `None` lets the provider choose.
    pub availability_zone: Option<String>,
    /// Maximum hourly price for a spot bid; `None` launches on-demand.
    pub spot_bid_price: Option<String>,
}

impl InstanceSpecification {
    /// Returns `true` when this specification launches via the spot market.
    #[must_use]
    pub fn is_spot(&self) -> bool {
        self.spot_bid_price.is_some()
    }
}

/// Lifecycle phase of an [`Instance`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LifecycleState {
    /// No cloud resources held. The starting and post-destroy state.
    Inert,
    /// A create sequence is in flight.
    Creating,
    /// The instance is provisioned and usable.
    Active,
    /// A destroy sequence is in flight.
    Destroying,
}

impl LifecycleState {
    fn name(self) -> &'static str {
        match self {
            Self::Inert => "inert",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Destroying => "destroying",
        }
    }
}

/// One EC2 instance and the resources orchestrated around it.
pub struct Instance<E: Ec2Api + 'static> {
    client: Arc<E>,
    name: String,
    unique_key: String,
    spec: InstanceSpecification,
    state: LifecycleState,
    instance_id: Option<String>,
    spot_request_id: Option<String>,
    address: Option<ElasticAddress>,
    public_ip: Option<String>,
    key_name: Option<String>,
    private_key: Option<String>,
    availability_zone: Option<String>,
    allocator: Arc<MountPointAllocator>,
    volumes: Vec<Volume<E>>,
    poll_interval: Duration,
    boot_timeout: Duration,
}

impl<E: Ec2Api + 'static> Instance<E> {
    /// Creates an inert orchestrator for a named instance. Nothing is
    /// provisioned until [`Instance::create`] runs.
    #[must_use]
    pub fn new(client: Arc<E>, name: impl Into<String>, spec: InstanceSpecification) -> Self {
        Self {
            client,
            name: name.into(),
            unique_key: uuid::Uuid::new_v4().simple().to_string(),
            spec,
            state: LifecycleState::Inert,
            instance_id: None,
            spot_request_id: None,
            address: None,
            public_ip: None,
            key_name: None,
            private_key: None,
            availability_zone: None,
            allocator: Arc::new(MountPointAllocator::new()),
            volumes: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
        }
    }

    /// Overrides the pause between remote state queries.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the bound on the initial boot wait.
    #[must_use]
    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    /// Rebuilds an orchestrator around an instance this tool created earlier,
    /// adopting its security group, key pair name, public IP, and attached
    /// volumes. The elastic IP is reported but left alone on destroy because
    /// this process did not allocate it.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidArgument`] when the description lacks the
    /// correlation tag, and propagates volume discovery failures.
    pub async fn reconnect(
        client: Arc<E>,
        description: &InstanceDescription,
        spec: InstanceSpecification,
    ) -> Result<Self, Ec2Error> {
        let unique_key = description
            .tag(TAG_UNIQUE_KEY)
            .ok_or_else(|| {
                Ec2Error::InvalidArgument(format!(
                    "instance {} was not created by this tool",
                    description.id
                ))
            })?
            .to_owned();
        let name = description
            .tag(crate::api::TAG_NAME)
            .unwrap_or(description.id.as_str())
            .to_owned();

        let allocator = Arc::new(MountPointAllocator::new());
        let attached = client
            .describe_volumes_for_instance(&description.id)
            .await?;
        let mut volumes = Vec::new();
        for volume in &attached {
            let Some(attachment) = volume.attachment_for(&description.id) else {
                continue;
            };
            allocator.reserve(&attachment.device).await;
            let volume_name = volume
                .tag(TAG_VOLUME_NAME)
                .unwrap_or(volume.id.as_str())
                .to_owned();
            let mut handle = Volume::new(
                Arc::clone(&client),
                Arc::clone(&allocator),
                volume_name,
                DEFAULT_POLL_INTERVAL,
            );
            handle.adopt_attached(volume.id.clone(), attachment.device.clone());
            volumes.push(handle);
        }

        Ok(Self {
            client,
            name,
            unique_key,
            spec,
            state: LifecycleState::Active,
            instance_id: Some(description.id.clone()),
            spot_request_id: None,
            address: None,
            public_ip: description.public_ip.clone(),
            key_name: description.key_name.clone(),
            private_key: None,
            availability_zone: description.availability_zone.clone(),
            allocator,
            volumes,
            poll_interval: DEFAULT_POLL_INTERVAL,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
        })
    }

    /// Lists every non-terminated instance this tool created, account-wide.
    ///
    /// # Errors
    ///
    /// Propagates the describe failure.
    pub async fn list_managed(client: &E) -> Result<Vec<InstanceDescription>, Ec2Error> {
        client
            .describe_instances_by_tag(TAG_CREATED_BY, CREATED_BY_VALUE)
            .await
    }

    /// Display name of the instance.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Random key correlating every resource provisioned for this instance.
    #[must_use]
    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    /// Cloud instance identifier, once launched.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Public IP of the instance, once provisioned or discovered on
    /// reconnect. An adopted address is reported here but never released.
    #[must_use]
    pub fn public_ip(&self) -> Option<&str> {
        self.public_ip.as_deref()
    }

    /// Zone the instance landed in, once known.
    #[must_use]
    pub fn availability_zone(&self) -> Option<&str> {
        self.availability_zone.as_deref()
    }

    /// PEM private key for the instance's key pair, when this process created
    /// or loaded it.
    #[must_use]
    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    /// Returns `true` once the instance is provisioned and usable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    /// Names of the volumes currently mounted.
    #[must_use]
    pub fn volume_names(&self) -> Vec<&str> {
        self.volumes.iter().map(Volume::name).collect()
    }

    /// Name of the security group provisioned for this instance.
    #[must_use]
    pub fn security_group_name(&self) -> String {
        format!("ec2manager-{}", self.unique_key)
    }

    fn require_state(&self, wanted: LifecycleState, operation: &str) -> Result<(), Ec2Error> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(Ec2Error::InvalidState {
                state: self.state.name().to_owned(),
                operation: operation.to_owned(),
            })
        }
    }

    fn attachment_context(&self) -> Result<AttachmentContext, Ec2Error> {
        let instance_id = self.instance_id.clone().ok_or_else(|| Ec2Error::InvalidState {
            state: self.state.name().to_owned(),
            operation: String::from("derive attachment context"),
        })?;
        let availability_zone =
            self.availability_zone.clone().ok_or_else(|| Ec2Error::InvalidState {
                state: self.state.name().to_owned(),
                operation: String::from("derive attachment context"),
            })?;
        Ok(AttachmentContext {
            instance_id,
            availability_zone,
            security_group: self.security_group_name(),
            instance_name: self.name.clone(),
        })
    }

    /// Materialises a volume from `source`, attaches and mounts it, and opens
    /// the ports its workload requires. Volume names are unique per instance.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidState`] unless the instance is active,
    /// [`Ec2Error::InvalidArgument`] for a duplicate name or malformed
    /// source, and propagates setup failures (annotated with any rollback
    /// failures).
    pub async fn mount_volume(
        &mut self,
        name: &str,
        source: &str,
        guest: &dyn GuestConfigurator,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        self.require_state(LifecycleState::Active, "mount a volume")?;
        if self.volumes.iter().any(|volume| volume.name() == name) {
            return Err(Ec2Error::InvalidArgument(format!(
                "a volume named '{name}' is already mounted"
            )));
        }
        let context = self.attachment_context()?;
        let mut volume = Volume::new(
            Arc::clone(&self.client),
            Arc::clone(&self.allocator),
            name,
            self.poll_interval,
        );
        volume.setup(source, &context, guest, sink, cancel).await?;
        self.volumes.push(volume);
        Ok(())
    }

    /// Detaches a mounted volume and deletes it from the cloud.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidState`] unless the instance is active,
    /// [`Ec2Error::InvalidArgument`] for an unknown name, and propagates
    /// detach and delete failures.
    pub async fn unmount_volume(
        &mut self,
        name: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Ec2Error> {
        self.require_state(LifecycleState::Active, "unmount a volume")?;
        let instance_id = self.attachment_context()?.instance_id;
        let Some(index) = self.volumes.iter().position(|volume| volume.name() == name) else {
            return Err(Ec2Error::InvalidArgument(format!(
                "no volume named '{name}' is mounted"
            )));
        };
        let mut volume = self.volumes.remove(index);
        if let Err(err) = volume.delete(&instance_id, sink, cancel).await {
            self.volumes.insert(index, volume);
            return Err(err);
        }
        Ok(())
    }

    /// Snapshots a mounted volume under `snapshot_name` and returns the
    /// snapshot identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::InvalidArgument`] for an unknown name and
    /// propagates snapshot failures.
    pub async fn snapshot_volume(
        &self,
        name: &str,
        snapshot_name: &str,
        public: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<String, Ec2Error> {
        self.require_state(LifecycleState::Active, "snapshot a volume")?;
        let Some(volume) = self.volumes.iter().find(|volume| volume.name() == name) else {
            return Err(Ec2Error::InvalidArgument(format!(
                "no volume named '{name}' is mounted"
            )));
        };
        volume.create_snapshot(snapshot_name, public, sink, cancel).await
    }
}

fn guard(cancel: &CancellationToken, action: &str) -> Result<(), Ec2Error> {
    if cancel.is_cancelled() {
        Err(Ec2Error::Cancelled {
            action: action.to_owned(),
        })
    } else {
        Ok(())
    }
}
