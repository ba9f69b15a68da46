//! Device mount point allocation for attached volumes.
//!
//! Device namespaces are per-instance, so each instance owns one allocator.
//! The pool is the fixed ordered list of device names EC2 exposes for
//! secondary block devices; allocation picks the first unused entry under a
//! lock so concurrent attach calls on the same instance can never collide.

use std::collections::BTreeSet;

use tokio::sync::Mutex;

use crate::error::Ec2Error;

/// Device names available for secondary volume attachments, in allocation
/// order. `/dev/xvda` through `/dev/xvde` are reserved for the root device
/// and instance storage.
pub const DEVICE_POOL: [&str; 11] = [
    "/dev/xvdf",
    "/dev/xvdg",
    "/dev/xvdh",
    "/dev/xvdi",
    "/dev/xvdj",
    "/dev/xvdk",
    "/dev/xvdl",
    "/dev/xvdm",
    "/dev/xvdn",
    "/dev/xvdo",
    "/dev/xvdp",
];

/// Assigns and reclaims device names for one instance's volumes.
#[derive(Debug, Default)]
pub struct MountPointAllocator {
    in_use: Mutex<BTreeSet<String>>,
}

impl MountPointAllocator {
    /// Creates an allocator with every device name free.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the first unused device name.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::MountPointsExhausted`] when every name in the pool
    /// is already claimed.
    pub async fn allocate(&self) -> Result<String, Ec2Error> {
        let mut in_use = self.in_use.lock().await;
        for candidate in DEVICE_POOL {
            if !in_use.contains(candidate) {
                in_use.insert(candidate.to_owned());
                return Ok(candidate.to_owned());
            }
        }
        Err(Ec2Error::MountPointsExhausted)
    }

    /// Returns a device name to the pool. Releasing a name that was never
    /// claimed is a no-op.
    pub async fn release(&self, device: &str) {
        self.in_use.lock().await.remove(device);
    }

    /// Marks a device name as in use without allocating it, for volumes
    /// discovered already attached when reconnecting to a running instance.
    pub async fn reserve(&self, device: &str) {
        self.in_use.lock().await.insert(device.to_owned());
    }

    /// Number of device names currently claimed.
    pub async fn claimed(&self) -> usize {
        self.in_use.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn allocates_first_unused_in_pool_order() {
        let allocator = MountPointAllocator::new();
        let first = allocator.allocate().await.expect("first");
        let second = allocator.allocate().await.expect("second");
        assert_eq!(first, "/dev/xvdf");
        assert_eq!(second, "/dev/xvdg");

        allocator.release(&first).await;
        let reused = allocator.allocate().await.expect("reuse");
        assert_eq!(reused, "/dev/xvdf");
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        let allocator = Arc::new(MountPointAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..DEVICE_POOL.len() {
            let shared = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move { shared.allocate().await }));
        }

        let mut devices = BTreeSet::new();
        for handle in handles {
            let device = handle
                .await
                .expect("task join")
                .expect("allocation should succeed while pool has capacity");
            devices.insert(device);
        }
        assert_eq!(devices.len(), DEVICE_POOL.len(), "no duplicates assigned");
    }

    #[tokio::test]
    async fn exhausted_pool_fails_with_resource_exhausted() {
        let allocator = MountPointAllocator::new();
        for _ in 0..DEVICE_POOL.len() {
            allocator.allocate().await.expect("pool has capacity");
        }
        let err = allocator.allocate().await.expect_err("pool is exhausted");
        assert!(matches!(err, Ec2Error::MountPointsExhausted));
    }

    #[tokio::test]
    async fn reserve_excludes_device_from_allocation() {
        let allocator = MountPointAllocator::new();
        allocator.reserve("/dev/xvdf").await;
        let allocated = allocator.allocate().await.expect("allocate");
        assert_eq!(allocated, "/dev/xvdg");
    }
}
