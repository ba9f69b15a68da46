//! Core library for the EC2 manager.
//!
//! The crate orchestrates the full lifecycle of EC2 instances and their EBS
//! volumes: transactional creation with rollback, attach/detach with guest
//! configuration, snapshots, and a teardown that spares resources still
//! shared with other instances.

pub mod api;
pub mod config;
pub mod error;
pub mod guest;
pub mod instance;
pub mod keys;
pub mod lifecycle;
pub mod mount;
pub mod poll;
pub mod progress;
pub mod saga;
pub mod test_support;
pub mod volume;

pub use api::{AwsEc2, Credentials, Ec2Api, InstanceDescription};
pub use config::{ConfigError, ManagerConfig};
pub use error::Ec2Error;
pub use guest::{GuestConfigurator, PortRange, Protocol};
pub use instance::{Instance, InstanceSpecification};
pub use keys::{FileKeyStore, KeyStore, StoredKey};
pub use mount::MountPointAllocator;
pub use progress::{NullSink, ProgressSink, TracingSink};
pub use volume::{Volume, VolumeSource};
