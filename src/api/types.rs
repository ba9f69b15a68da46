//! Domain-shaped request and response types for the EC2 control plane.

use std::collections::BTreeMap;

use crate::guest::PortRange;

/// Tag marking resources this system created and may therefore delete.
pub const TAG_CREATED_BY: &str = "CreatedByEc2Manager";
/// Tag carrying the per-instance random key used to correlate resources.
pub const TAG_UNIQUE_KEY: &str = "UniqueKey";
/// Display-name tag.
pub const TAG_NAME: &str = "Name";
/// Tag carrying a volume's logical name.
pub const TAG_VOLUME_NAME: &str = "VolumeName";

/// Tag map attached to a cloud resource.
pub type Tags = BTreeMap<String, String>;

/// Parameters for launching an instance, on-demand or via a spot bid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpecification {
    /// Machine image to boot.
    pub image_id: String,
    /// Instance size class (for example `t2.micro`).
    pub size_class: String,
    /// Key pair name granting shell access.
    pub key_name: String,
    /// Security group the instance joins.
    pub security_group: String,
    /// Availability zone to pin placement to, when the caller cares.
    pub availability_zone: Option<String>,
}

/// A single ingress rule on a security group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngressRule {
    /// IP protocol (`tcp`, `udp`, or `icmp`).
    pub protocol: String,
    /// First port of the range; `-1` for all ICMP types.
    pub from_port: i32,
    /// Last port of the range; `-1` for all ICMP codes.
    pub to_port: i32,
}

impl IngressRule {
    /// Rule admitting a single TCP port.
    #[must_use]
    pub fn tcp(port: i32) -> Self {
        Self {
            protocol: String::from("tcp"),
            from_port: port,
            to_port: port,
        }
    }

    /// Rule admitting every ICMP type and code.
    #[must_use]
    pub fn all_icmp() -> Self {
        Self {
            protocol: String::from("icmp"),
            from_port: -1,
            to_port: -1,
        }
    }
}

impl From<PortRange> for IngressRule {
    fn from(range: PortRange) -> Self {
        Self {
            protocol: range.protocol.as_str().to_owned(),
            from_port: range.from_port,
            to_port: range.to_port,
        }
    }
}

/// Snapshot of an instance as the control plane reports it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceDescription {
    /// Provider instance identifier.
    pub id: String,
    /// Lifecycle state string (`pending`, `running`, `terminated`, ...).
    pub state: String,
    /// Public IPv4 address, once assigned.
    pub public_ip: Option<String>,
    /// Availability zone the instance landed in.
    pub availability_zone: Option<String>,
    /// Names of the security groups attached to the instance.
    pub security_groups: Vec<String>,
    /// Key pair name the instance was launched with.
    pub key_name: Option<String>,
    /// Tags attached to the instance.
    pub tags: Tags,
}

impl InstanceDescription {
    /// Returns a tag value by key.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// A newly created key pair, including the private material the provider
/// only returns once.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedKeyPair {
    /// Key pair name.
    pub name: String,
    /// PEM-encoded private key material.
    pub material: String,
    /// Fingerprint the provider derived from the key.
    pub fingerprint: String,
}

/// Snapshot of a spot instance request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpotRequestDescription {
    /// Spot request identifier.
    pub id: String,
    /// Request state (`open`, `active`, `closed`, `cancelled`, `failed`).
    pub state: String,
    /// Instance the bid produced, once fulfilled.
    pub instance_id: Option<String>,
}

/// One attachment edge between a volume and an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Instance the volume is attached to.
    pub instance_id: String,
    /// Device name the attachment uses.
    pub device: String,
    /// Attachment state (`attaching`, `attached`, `detaching`).
    pub state: String,
}

/// Snapshot of a volume as the control plane reports it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeDescription {
    /// Provider volume identifier.
    pub id: String,
    /// Volume state (`creating`, `available`, `in-use`, `deleting`).
    pub state: String,
    /// Current attachments; empty for a detached volume.
    pub attachments: Vec<VolumeAttachment>,
    /// Tags attached to the volume.
    pub tags: Tags,
}

impl VolumeDescription {
    /// Returns a tag value by key.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Returns the attachment edge for a specific instance, if present.
    #[must_use]
    pub fn attachment_for(&self, instance_id: &str) -> Option<&VolumeAttachment> {
        self.attachments
            .iter()
            .find(|attachment| attachment.instance_id == instance_id)
    }
}

/// Snapshot of an EBS snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotDescription {
    /// Provider snapshot identifier.
    pub id: String,
    /// Snapshot state (`pending`, `completed`, `error`).
    pub state: String,
}

/// An elastic IP address this process allocated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ElasticAddress {
    /// The public IPv4 address.
    pub public_ip: String,
    /// Allocation identifier, present on VPC-style accounts.
    pub allocation_id: Option<String>,
}
