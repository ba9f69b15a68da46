//! Cloud client adapter boundary.
//!
//! [`Ec2Api`] carries one method per remote operation the orchestrators use.
//! The adapter is deliberately thin: no retries, no backoff, no polling —
//! callers impose whatever waiting policy they need through the poller.
//! [`AwsEc2`] is the concrete `aws-sdk-ec2` implementation; tests drive the
//! orchestrators through the in-memory stub in `test_support`.

mod aws;
mod types;

use async_trait::async_trait;

use crate::error::Ec2Error;

pub use aws::AwsEc2;
pub use types::{
    CreatedKeyPair, ElasticAddress, IngressRule, InstanceDescription, LaunchSpecification,
    SnapshotDescription, SpotRequestDescription, TAG_CREATED_BY, TAG_NAME, TAG_UNIQUE_KEY,
    TAG_VOLUME_NAME, Tags, VolumeAttachment, VolumeDescription,
};

/// Access credentials for the cloud control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    /// Access key identifier.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
}

impl Credentials {
    /// Returns `true` when both halves of the credential pair are non-blank.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.access_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

/// Remote operations the orchestrators perform against the control plane.
///
/// Every method maps to a single asynchronous-completion API call; state
/// transitions are observed by callers through the describe methods.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Creates a security group and returns its identifier.
    async fn create_security_group(&self, name: &str, description: &str)
    -> Result<String, Ec2Error>;

    /// Deletes a security group by name.
    async fn delete_security_group(&self, name: &str) -> Result<(), Ec2Error>;

    /// Adds ingress rules to a security group.
    async fn authorize_ingress(&self, group: &str, rules: &[IngressRule]) -> Result<(), Ec2Error>;

    /// Creates a key pair, returning the private material the provider only
    /// discloses once.
    async fn create_key_pair(&self, name: &str) -> Result<CreatedKeyPair, Ec2Error>;

    /// Deletes a key pair by name.
    async fn delete_key_pair(&self, name: &str) -> Result<(), Ec2Error>;

    /// Returns the name of the key pair carrying the given fingerprint, when
    /// the cloud still knows one.
    async fn find_key_pair_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, Ec2Error>;

    /// Launches an on-demand instance, returning its identifier.
    async fn run_instance(&self, launch: &LaunchSpecification) -> Result<String, Ec2Error>;

    /// Submits a spot-market bid, returning the spot request identifier.
    async fn request_spot_instance(
        &self,
        bid_price: &str,
        launch: &LaunchSpecification,
    ) -> Result<String, Ec2Error>;

    /// Describes a spot request.
    async fn describe_spot_request(&self, id: &str)
    -> Result<SpotRequestDescription, Ec2Error>;

    /// Cancels a spot request.
    async fn cancel_spot_request(&self, id: &str) -> Result<(), Ec2Error>;

    /// Describes one instance; `None` when the control plane does not know it
    /// (yet).
    async fn describe_instance(&self, id: &str)
    -> Result<Option<InstanceDescription>, Ec2Error>;

    /// Lists instances carrying a tag, excluding terminated ones.
    async fn describe_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceDescription>, Ec2Error>;

    /// Lists every non-terminated instance visible to the account.
    async fn list_instances(&self) -> Result<Vec<InstanceDescription>, Ec2Error>;

    /// Requests termination of an instance.
    async fn terminate_instance(&self, id: &str) -> Result<(), Ec2Error>;

    /// Requests a reboot of an instance.
    async fn reboot_instance(&self, id: &str) -> Result<(), Ec2Error>;

    /// Attaches tags to a resource.
    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)])
    -> Result<(), Ec2Error>;

    /// Allocates an elastic IP address.
    async fn allocate_address(&self) -> Result<ElasticAddress, Ec2Error>;

    /// Associates an elastic IP with an instance.
    async fn associate_address(
        &self,
        instance_id: &str,
        address: &ElasticAddress,
    ) -> Result<(), Ec2Error>;

    /// Breaks the association between an elastic IP and its instance.
    async fn disassociate_address(&self, address: &ElasticAddress) -> Result<(), Ec2Error>;

    /// Releases an elastic IP back to the provider.
    async fn release_address(&self, address: &ElasticAddress) -> Result<(), Ec2Error>;

    /// Materialises a volume from a snapshot in the given zone, returning the
    /// new volume's identifier.
    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        availability_zone: &str,
    ) -> Result<String, Ec2Error>;

    /// Describes one volume; `None` when the control plane does not know it.
    async fn describe_volume(&self, id: &str) -> Result<Option<VolumeDescription>, Ec2Error>;

    /// Lists volumes with an attachment to the given instance.
    async fn describe_volumes_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<VolumeDescription>, Ec2Error>;

    /// Attaches a volume to an instance at a device name.
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), Ec2Error>;

    /// Detaches a volume from an instance.
    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<(), Ec2Error>;

    /// Deletes a volume.
    async fn delete_volume(&self, volume_id: &str) -> Result<(), Ec2Error>;

    /// Starts a snapshot of a volume, returning the snapshot identifier.
    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<String, Ec2Error>;

    /// Describes one snapshot; `None` when the control plane does not know it.
    async fn describe_snapshot(&self, id: &str)
    -> Result<Option<SnapshotDescription>, Ec2Error>;

    /// Grants the create-volume permission on a snapshot to everyone.
    async fn make_snapshot_public(&self, id: &str) -> Result<(), Ec2Error>;
}
