//! Guest-configuration collaborator interface.
//!
//! Once a volume is attached, the guest operating system still has to mount
//! the block device and run any workload-specific setup hook. That work
//! happens over a remote shell and is outside this crate; the orchestrator
//! only consumes the interface below.

use async_trait::async_trait;

use crate::error::Ec2Error;

/// Inclusive port range a guest workload needs opened on the instance's
/// security group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortRange {
    /// First port in the range.
    pub from_port: i32,
    /// Last port in the range.
    pub to_port: i32,
    /// IP protocol, `tcp` or `udp`.
    pub protocol: Protocol,
}

/// IP protocol for an ingress port range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Wire name of the protocol as the EC2 API expects it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Performs guest-side device setup on behalf of the volume orchestrator.
#[async_trait]
pub trait GuestConfigurator: Send + Sync {
    /// Mounts `device` at `mount_point` inside the guest and runs any setup
    /// hook the mounted payload carries.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::Guest`] when the guest-side work fails.
    async fn mount_and_setup_device(&self, device: &str, mount_point: &str)
    -> Result<(), Ec2Error>;

    /// Reports the port ranges the workload at `mount_point` requires opened.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::Guest`] when the guest cannot be queried.
    async fn required_ingress_ports(&self, mount_point: &str) -> Result<Vec<PortRange>, Ec2Error>;
}
