//! Test doubles shared by unit and integration tests.
//!
//! [`StubEc2`] is an in-memory control plane: resources live in maps, state
//! transitions follow short per-resource scripts that advance one step per
//! describe call, and named operations can be made to fail or to trigger a
//! cancellation token. Inspection methods let tests assert on the resulting
//! cloud state and on the call sequence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::{
    CreatedKeyPair, Ec2Api, ElasticAddress, IngressRule, InstanceDescription,
    LaunchSpecification, SnapshotDescription, SpotRequestDescription, Tags, VolumeAttachment,
    VolumeDescription,
};
use crate::error::Ec2Error;
use crate::guest::{GuestConfigurator, PortRange};
use crate::keys::{KeyStore, StoredKey};
use crate::progress::ProgressSink;

/// A state script that advances one step per observation and then holds its
/// final state.
#[derive(Clone, Debug)]
struct Scripted {
    states: Vec<String>,
    cursor: usize,
}

impl Scripted {
    fn new(states: Vec<String>) -> Self {
        Self { states, cursor: 0 }
    }

    fn fixed(state: &str) -> Self {
        Self::new(vec![state.to_owned()])
    }

    /// Returns the current state and moves the cursor forward.
    fn observe(&mut self) -> String {
        let state = self
            .states
            .get(self.cursor)
            .or_else(|| self.states.last())
            .cloned()
            .unwrap_or_else(|| String::from("unknown"));
        if self.cursor + 1 < self.states.len() {
            self.cursor += 1;
        }
        state
    }

    fn current(&self) -> String {
        self.states
            .get(self.cursor)
            .or_else(|| self.states.last())
            .cloned()
            .unwrap_or_else(|| String::from("unknown"))
    }

    fn replace(&mut self, states: Vec<String>) {
        self.states = states;
        self.cursor = 0;
    }
}

#[derive(Debug)]
struct SecurityGroupRecord {
    rules: Vec<IngressRule>,
}

#[derive(Debug)]
struct InstanceRecord {
    script: Scripted,
    description: InstanceDescription,
}

#[derive(Debug)]
struct SpotRecord {
    script: Scripted,
    instance_id: Option<String>,
    launch: LaunchSpecification,
}

#[derive(Debug)]
struct AttachmentRecord {
    instance_id: String,
    device: String,
    script: Scripted,
}

#[derive(Debug)]
struct VolumeRecord {
    script: Scripted,
    attachments: Vec<AttachmentRecord>,
    tags: Tags,
}

#[derive(Debug)]
struct SnapshotRecord {
    script: Scripted,
    public: bool,
}

#[derive(Debug, Default)]
struct StubState {
    next_id: u32,
    security_groups: BTreeMap<String, SecurityGroupRecord>,
    key_pairs: BTreeMap<String, String>,
    instances: BTreeMap<String, InstanceRecord>,
    spot_requests: BTreeMap<String, SpotRecord>,
    volumes: BTreeMap<String, VolumeRecord>,
    snapshots: BTreeMap<String, SnapshotRecord>,
    addresses: BTreeMap<String, ElasticAddress>,
    released_addresses: Vec<String>,
    launch_plan: Vec<String>,
    spot_plan: Vec<String>,
    reboot_plan: Option<Vec<String>>,
    failures: BTreeMap<String, Option<String>>,
    cancel_hooks: BTreeMap<String, CancellationToken>,
    calls: Vec<String>,
}

impl StubState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn enter(&mut self, action: &str, id: &str) -> Result<(), Ec2Error> {
        self.calls.push(format!("{action} {id}"));
        if let Some(token) = self.cancel_hooks.get(action) {
            token.cancel();
        }
        if let Some(code) = self.failures.get(action) {
            return Err(Ec2Error::Api {
                action: action.to_owned(),
                code: code.clone(),
                message: format!("injected failure for {action}"),
            });
        }
        Ok(())
    }

    fn launch(&mut self, launch: &LaunchSpecification) -> String {
        let id = self.next("i");
        let script = Scripted::new(self.launch_plan.clone());
        let description = InstanceDescription {
            id: id.clone(),
            state: script.current(),
            public_ip: None,
            availability_zone: Some(
                launch
                    .availability_zone
                    .clone()
                    .unwrap_or_else(|| String::from("us-east-1a")),
            ),
            security_groups: vec![launch.security_group.clone()],
            key_name: Some(launch.key_name.clone()),
            tags: Tags::new(),
        };
        self.instances
            .insert(id.clone(), InstanceRecord { script, description });
        id
    }

    fn observe_instance(&mut self, id: &str) -> Option<InstanceDescription> {
        let record = self.instances.get_mut(id)?;
        record.description.state = record.script.observe();
        Some(record.description.clone())
    }
}

/// In-memory [`Ec2Api`] implementation for tests.
#[derive(Debug, Default)]
pub struct StubEc2 {
    state: Mutex<StubState>,
}

impl StubEc2 {
    /// Creates an empty stub cloud with the default state scripts: launched
    /// instances go `pending` then `running`, spot bids go `open` then
    /// `active`, created volumes go `creating` then `available`.
    #[must_use]
    pub fn new() -> Self {
        let state = StubState {
            launch_plan: vec![String::from("pending"), String::from("running")],
            spot_plan: vec![String::from("open"), String::from("active")],
            ..StubState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Overrides the state script applied to the next launched instances.
    pub async fn set_launch_plan(&self, states: &[&str]) {
        self.state.lock().await.launch_plan = states.iter().map(|s| (*s).to_owned()).collect();
    }

    /// Overrides the state script applied to spot bids.
    pub async fn set_spot_plan(&self, states: &[&str]) {
        self.state.lock().await.spot_plan = states.iter().map(|s| (*s).to_owned()).collect();
    }

    /// Makes a reboot replace the rebooted instance's state script.
    pub async fn set_reboot_plan(&self, states: &[&str]) {
        self.state.lock().await.reboot_plan =
            Some(states.iter().map(|s| (*s).to_owned()).collect());
    }

    /// Makes every call to `action` fail with a codeless API error.
    pub async fn fail_on(&self, action: &str) {
        self.state.lock().await.failures.insert(action.to_owned(), None);
    }

    /// Makes every call to `action` fail with the given provider error code.
    pub async fn fail_on_with_code(&self, action: &str, code: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(action.to_owned(), Some(code.to_owned()));
    }

    /// Stops failing calls to `action`.
    pub async fn clear_failure(&self, action: &str) {
        self.state.lock().await.failures.remove(action);
    }

    /// Cancels `token` as a side effect of calls to `action`.
    pub async fn cancel_on(&self, action: &str, token: CancellationToken) {
        self.state
            .lock()
            .await
            .cancel_hooks
            .insert(action.to_owned(), token);
    }

    /// Seeds a snapshot.
    pub async fn insert_snapshot(&self, id: &str) {
        self.state.lock().await.snapshots.insert(
            id.to_owned(),
            SnapshotRecord {
                script: Scripted::fixed("completed"),
                public: false,
            },
        );
    }

    /// Seeds a security group.
    pub async fn insert_security_group(&self, name: &str) {
        self.state
            .lock()
            .await
            .security_groups
            .insert(name.to_owned(), SecurityGroupRecord { rules: Vec::new() });
    }

    /// Seeds a key pair.
    pub async fn insert_key_pair(&self, name: &str, fingerprint: &str) {
        self.state
            .lock()
            .await
            .key_pairs
            .insert(name.to_owned(), fingerprint.to_owned());
    }

    /// Seeds an instance and returns its identifier. An empty `id` is
    /// replaced with a generated one; the instance holds its given state.
    pub async fn insert_instance(&self, description: InstanceDescription) -> String {
        let mut state = self.state.lock().await;
        let id = if description.id.is_empty() {
            state.next("i")
        } else {
            description.id.clone()
        };
        let mut description = description;
        description.id = id.clone();
        let script = Scripted::fixed(&description.state);
        state
            .instances
            .insert(id.clone(), InstanceRecord { script, description });
        id
    }

    /// Seeds a volume and returns its identifier. An empty `id` is replaced
    /// with a generated one.
    pub async fn insert_volume(&self, description: VolumeDescription) -> String {
        let mut state = self.state.lock().await;
        let id = if description.id.is_empty() {
            state.next("vol")
        } else {
            description.id.clone()
        };
        let attachments = description
            .attachments
            .iter()
            .map(|attachment| AttachmentRecord {
                instance_id: attachment.instance_id.clone(),
                device: attachment.device.clone(),
                script: Scripted::fixed(&attachment.state),
            })
            .collect();
        state.volumes.insert(
            id.clone(),
            VolumeRecord {
                script: Scripted::fixed(&description.state),
                attachments,
                tags: description.tags,
            },
        );
        id
    }

    /// Names of the security groups that currently exist.
    pub async fn security_group_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .security_groups
            .keys()
            .cloned()
            .collect()
    }

    /// Ingress rules on a security group.
    pub async fn ingress_rules(&self, group: &str) -> Vec<IngressRule> {
        self.state
            .lock()
            .await
            .security_groups
            .get(group)
            .map(|record| record.rules.clone())
            .unwrap_or_default()
    }

    /// Names of the key pairs that currently exist.
    pub async fn key_pair_names(&self) -> Vec<String> {
        self.state.lock().await.key_pairs.keys().cloned().collect()
    }

    /// Current view of one instance, without advancing its state script.
    pub async fn instance(&self, id: &str) -> Option<InstanceDescription> {
        let state = self.state.lock().await;
        state.instances.get(id).map(|record| {
            let mut description = record.description.clone();
            description.state = record.script.current();
            description
        })
    }

    /// Identifiers of the volumes that currently exist.
    pub async fn volume_ids(&self) -> Vec<String> {
        self.state.lock().await.volumes.keys().cloned().collect()
    }

    /// Current view of one volume, without advancing its state script.
    pub async fn volume(&self, id: &str) -> Option<VolumeDescription> {
        let state = self.state.lock().await;
        state.volumes.get(id).map(|record| volume_view(id, record))
    }

    /// Identifiers of the snapshots that currently exist.
    pub async fn snapshot_ids(&self) -> Vec<String> {
        self.state.lock().await.snapshots.keys().cloned().collect()
    }

    /// Whether a snapshot has been opened to every account.
    pub async fn snapshot_is_public(&self, id: &str) -> bool {
        self.state
            .lock()
            .await
            .snapshots
            .get(id)
            .is_some_and(|record| record.public)
    }

    /// Public IPs of the elastic addresses currently held.
    pub async fn held_addresses(&self) -> Vec<String> {
        self.state.lock().await.addresses.keys().cloned().collect()
    }

    /// Public IPs of the elastic addresses that have been released.
    pub async fn released_addresses(&self) -> Vec<String> {
        self.state.lock().await.released_addresses.clone()
    }

    /// The `"action id"` log of every call made so far.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls made to a given action.
    pub async fn call_count(&self, action: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|entry| entry.starts_with(action))
            .count()
    }
}

fn volume_view(id: &str, record: &VolumeRecord) -> VolumeDescription {
    VolumeDescription {
        id: id.to_owned(),
        state: record.script.current(),
        attachments: record
            .attachments
            .iter()
            .map(|attachment| VolumeAttachment {
                instance_id: attachment.instance_id.clone(),
                device: attachment.device.clone(),
                state: attachment.script.current(),
            })
            .collect(),
        tags: record.tags.clone(),
    }
}

fn observe_volume(id: &str, record: &mut VolumeRecord) -> VolumeDescription {
    VolumeDescription {
        id: id.to_owned(),
        state: record.script.observe(),
        attachments: record
            .attachments
            .iter_mut()
            .map(|attachment| VolumeAttachment {
                instance_id: attachment.instance_id.clone(),
                device: attachment.device.clone(),
                state: attachment.script.observe(),
            })
            .collect(),
        tags: record.tags.clone(),
    }
}

fn not_found(action: &str, code: &str, id: &str) -> Ec2Error {
    Ec2Error::Api {
        action: action.to_owned(),
        code: Some(code.to_owned()),
        message: format!("{id} does not exist"),
    }
}

#[async_trait]
impl Ec2Api for StubEc2 {
    async fn create_security_group(
        &self,
        name: &str,
        _description: &str,
    ) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("create_security_group", name)?;
        if state.security_groups.contains_key(name) {
            return Err(Ec2Error::Api {
                action: String::from("create_security_group"),
                code: Some(String::from("InvalidGroup.Duplicate")),
                message: format!("group {name} already exists"),
            });
        }
        let id = state.next("sg");
        state
            .security_groups
            .insert(name.to_owned(), SecurityGroupRecord { rules: Vec::new() });
        Ok(id)
    }

    async fn delete_security_group(&self, name: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("delete_security_group", name)?;
        if state.security_groups.remove(name).is_none() {
            return Err(not_found(
                "delete_security_group",
                crate::error::GROUP_NOT_FOUND,
                name,
            ));
        }
        Ok(())
    }

    async fn authorize_ingress(&self, group: &str, rules: &[IngressRule]) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("authorize_ingress", group)?;
        let Some(record) = state.security_groups.get_mut(group) else {
            return Err(not_found(
                "authorize_ingress",
                crate::error::GROUP_NOT_FOUND,
                group,
            ));
        };
        let fresh: Vec<IngressRule> = rules
            .iter()
            .filter(|rule| !record.rules.contains(rule))
            .cloned()
            .collect();
        if fresh.is_empty() && !rules.is_empty() {
            return Err(Ec2Error::Api {
                action: String::from("authorize_ingress"),
                code: Some(crate::error::DUPLICATE_PERMISSION.to_owned()),
                message: String::from("rule already exists"),
            });
        }
        record.rules.extend(fresh);
        Ok(())
    }

    async fn create_key_pair(&self, name: &str) -> Result<CreatedKeyPair, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("create_key_pair", name)?;
        let fingerprint = state.next("fp");
        let material = format!("material-for-{name}");
        state.key_pairs.insert(name.to_owned(), fingerprint.clone());
        Ok(CreatedKeyPair {
            name: name.to_owned(),
            material,
            fingerprint,
        })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("delete_key_pair", name)?;
        state.key_pairs.remove(name);
        Ok(())
    }

    async fn find_key_pair_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("find_key_pair_by_fingerprint", fingerprint)?;
        Ok(state
            .key_pairs
            .iter()
            .find(|(_, candidate)| candidate.as_str() == fingerprint)
            .map(|(name, _)| name.clone()))
    }

    async fn run_instance(&self, launch: &LaunchSpecification) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("run_instance", &launch.image_id)?;
        Ok(state.launch(launch))
    }

    async fn request_spot_instance(
        &self,
        _bid_price: &str,
        launch: &LaunchSpecification,
    ) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("request_spot_instance", &launch.image_id)?;
        let id = state.next("sir");
        let script = Scripted::new(state.spot_plan.clone());
        state.spot_requests.insert(
            id.clone(),
            SpotRecord {
                script,
                instance_id: None,
                launch: launch.clone(),
            },
        );
        Ok(id)
    }

    async fn describe_spot_request(&self, id: &str) -> Result<SpotRequestDescription, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("describe_spot_request", id)?;
        let Some(record) = state.spot_requests.get_mut(id) else {
            return Err(not_found(
                "describe_spot_request",
                "InvalidSpotInstanceRequestID.NotFound",
                id,
            ));
        };
        let request_state = record.script.observe();
        let launch = record.launch.clone();
        if request_state == "active" && record.instance_id.is_none() {
            let instance_id = state.launch(&launch);
            if let Some(again) = state.spot_requests.get_mut(id) {
                again.instance_id = Some(instance_id);
            }
        }
        let instance_id = state
            .spot_requests
            .get(id)
            .and_then(|record| record.instance_id.clone());
        Ok(SpotRequestDescription {
            id: id.to_owned(),
            state: request_state,
            instance_id,
        })
    }

    async fn cancel_spot_request(&self, id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("cancel_spot_request", id)?;
        let Some(record) = state.spot_requests.get_mut(id) else {
            return Err(not_found(
                "cancel_spot_request",
                "InvalidSpotInstanceRequestID.NotFound",
                id,
            ));
        };
        record.script.replace(vec![String::from("cancelled")]);
        Ok(())
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<InstanceDescription>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("describe_instance", id)?;
        Ok(state.observe_instance(id))
    }

    async fn describe_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceDescription>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("describe_instances_by_tag", key)?;
        let mut matches = Vec::new();
        for record in state.instances.values_mut() {
            record.description.state = record.script.observe();
            if record.description.state != "terminated"
                && record.description.tag(key) == Some(value)
            {
                matches.push(record.description.clone());
            }
        }
        Ok(matches)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceDescription>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("list_instances", "*")?;
        let mut listed = Vec::new();
        for record in state.instances.values_mut() {
            record.description.state = record.script.observe();
            if record.description.state != "terminated" {
                listed.push(record.description.clone());
            }
        }
        Ok(listed)
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("terminate_instance", id)?;
        let Some(record) = state.instances.get_mut(id) else {
            return Err(not_found(
                "terminate_instance",
                "InvalidInstanceID.NotFound",
                id,
            ));
        };
        record
            .script
            .replace(vec![String::from("shutting-down"), String::from("terminated")]);
        Ok(())
    }

    async fn reboot_instance(&self, id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("reboot_instance", id)?;
        let plan = state.reboot_plan.clone();
        let Some(record) = state.instances.get_mut(id) else {
            return Err(not_found(
                "reboot_instance",
                "InvalidInstanceID.NotFound",
                id,
            ));
        };
        if let Some(states) = plan {
            record.script.replace(states);
        }
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("create_tags", resource_id)?;
        if let Some(record) = state.instances.get_mut(resource_id) {
            for (key, value) in tags {
                record.description.tags.insert(key.clone(), value.clone());
            }
            return Ok(());
        }
        if let Some(record) = state.volumes.get_mut(resource_id) {
            for (key, value) in tags {
                record.tags.insert(key.clone(), value.clone());
            }
            return Ok(());
        }
        if state.snapshots.contains_key(resource_id) {
            return Ok(());
        }
        Err(not_found("create_tags", "InvalidID", resource_id))
    }

    async fn allocate_address(&self) -> Result<ElasticAddress, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("allocate_address", "*")?;
        let serial = state.next("eipalloc");
        let public_ip = format!("203.0.113.{}", state.next_id);
        let address = ElasticAddress {
            public_ip: public_ip.clone(),
            allocation_id: Some(serial),
        };
        state.addresses.insert(public_ip, address.clone());
        Ok(address)
    }

    async fn associate_address(
        &self,
        instance_id: &str,
        address: &ElasticAddress,
    ) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("associate_address", instance_id)?;
        let Some(record) = state.instances.get_mut(instance_id) else {
            return Err(not_found(
                "associate_address",
                "InvalidInstanceID.NotFound",
                instance_id,
            ));
        };
        record.description.public_ip = Some(address.public_ip.clone());
        Ok(())
    }

    async fn disassociate_address(&self, address: &ElasticAddress) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("disassociate_address", &address.public_ip)?;
        for record in state.instances.values_mut() {
            if record.description.public_ip.as_deref() == Some(address.public_ip.as_str()) {
                record.description.public_ip = None;
            }
        }
        Ok(())
    }

    async fn release_address(&self, address: &ElasticAddress) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("release_address", &address.public_ip)?;
        state.addresses.remove(&address.public_ip);
        state.released_addresses.push(address.public_ip.clone());
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        _availability_zone: &str,
    ) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("create_volume_from_snapshot", snapshot_id)?;
        if !state.snapshots.contains_key(snapshot_id) {
            return Err(not_found(
                "create_volume_from_snapshot",
                "InvalidSnapshot.NotFound",
                snapshot_id,
            ));
        }
        let id = state.next("vol");
        state.volumes.insert(
            id.clone(),
            VolumeRecord {
                script: Scripted::new(vec![
                    String::from("creating"),
                    String::from("available"),
                ]),
                attachments: Vec::new(),
                tags: Tags::new(),
            },
        );
        Ok(id)
    }

    async fn describe_volume(&self, id: &str) -> Result<Option<VolumeDescription>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("describe_volume", id)?;
        Ok(state
            .volumes
            .get_mut(id)
            .map(|record| observe_volume(id, record)))
    }

    async fn describe_volumes_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<VolumeDescription>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("describe_volumes_for_instance", instance_id)?;
        let mut matched = Vec::new();
        for (id, record) in &mut state.volumes {
            if record
                .attachments
                .iter()
                .any(|attachment| attachment.instance_id == instance_id)
            {
                matched.push(observe_volume(id, record));
            }
        }
        Ok(matched)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("attach_volume", volume_id)?;
        if !state.instances.contains_key(instance_id) {
            return Err(not_found(
                "attach_volume",
                "InvalidInstanceID.NotFound",
                instance_id,
            ));
        }
        let Some(record) = state.volumes.get_mut(volume_id) else {
            return Err(not_found(
                "attach_volume",
                crate::error::VOLUME_NOT_FOUND,
                volume_id,
            ));
        };
        record.script.replace(vec![String::from("in-use")]);
        record.attachments.push(AttachmentRecord {
            instance_id: instance_id.to_owned(),
            device: device.to_owned(),
            script: Scripted::new(vec![
                String::from("attaching"),
                String::from("attached"),
            ]),
        });
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("detach_volume", volume_id)?;
        let Some(record) = state.volumes.get_mut(volume_id) else {
            return Err(not_found(
                "detach_volume",
                crate::error::VOLUME_NOT_FOUND,
                volume_id,
            ));
        };
        record
            .attachments
            .retain(|attachment| attachment.instance_id != instance_id);
        record.script.replace(vec![String::from("available")]);
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("delete_volume", volume_id)?;
        if state.volumes.remove(volume_id).is_none() {
            return Err(not_found(
                "delete_volume",
                crate::error::VOLUME_NOT_FOUND,
                volume_id,
            ));
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        _description: &str,
    ) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("create_snapshot", volume_id)?;
        if !state.volumes.contains_key(volume_id) {
            return Err(not_found(
                "create_snapshot",
                crate::error::VOLUME_NOT_FOUND,
                volume_id,
            ));
        }
        let id = state.next("snap");
        state.snapshots.insert(
            id.clone(),
            SnapshotRecord {
                script: Scripted::new(vec![
                    String::from("pending"),
                    String::from("completed"),
                ]),
                public: false,
            },
        );
        Ok(id)
    }

    async fn describe_snapshot(&self, id: &str) -> Result<Option<SnapshotDescription>, Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("describe_snapshot", id)?;
        Ok(state
            .snapshots
            .get_mut(id)
            .map(|record| SnapshotDescription {
                id: id.to_owned(),
                state: record.script.observe(),
            }))
    }

    async fn make_snapshot_public(&self, id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().await;
        state.enter("make_snapshot_public", id)?;
        let Some(record) = state.snapshots.get_mut(id) else {
            return Err(not_found(
                "make_snapshot_public",
                "InvalidSnapshot.NotFound",
                id,
            ));
        };
        record.public = true;
        Ok(())
    }
}

/// In-memory [`KeyStore`].
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    key: std::sync::Mutex<Option<StoredKey>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `key`.
    #[must_use]
    pub fn holding(key: StoredKey) -> Self {
        Self {
            key: std::sync::Mutex::new(Some(key)),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_key(&self) -> Result<Option<StoredKey>, Ec2Error> {
        self.key
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| Ec2Error::KeyStore(String::from("key store lock poisoned")))
    }

    fn save_key(&self, key: &StoredKey) -> Result<(), Ec2Error> {
        self.key
            .lock()
            .map(|mut guard| *guard = Some(key.clone()))
            .map_err(|_| Ec2Error::KeyStore(String::from("key store lock poisoned")))
    }
}

/// [`GuestConfigurator`] returning canned answers and recording mounts.
#[derive(Debug, Default)]
pub struct StaticGuest {
    ports: Vec<PortRange>,
    fail_mounts: bool,
    mounts: std::sync::Mutex<Vec<(String, String)>>,
}

impl StaticGuest {
    /// Guest with no port requirements.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Guest whose workloads require the given ports opened.
    #[must_use]
    pub fn requiring(ports: Vec<PortRange>) -> Self {
        Self {
            ports,
            ..Self::default()
        }
    }

    /// Guest whose mount step always fails.
    #[must_use]
    pub fn failing_mounts() -> Self {
        Self {
            fail_mounts: true,
            ..Self::default()
        }
    }

    /// The `(device, mount_point)` pairs mounted so far.
    pub fn mounted(&self) -> Vec<(String, String)> {
        self.mounts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GuestConfigurator for StaticGuest {
    async fn mount_and_setup_device(
        &self,
        device: &str,
        mount_point: &str,
    ) -> Result<(), Ec2Error> {
        if self.fail_mounts {
            return Err(Ec2Error::Guest(format!("mount of {device} refused")));
        }
        if let Ok(mut guard) = self.mounts.lock() {
            guard.push((device.to_owned(), mount_point.to_owned()));
        }
        Ok(())
    }

    async fn required_ingress_ports(
        &self,
        _mount_point: &str,
    ) -> Result<Vec<PortRange>, Ec2Error> {
        Ok(self.ports.clone())
    }
}

/// [`ProgressSink`] that records every line for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: std::sync::Mutex<Vec<String>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lines logged so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Whether any logged line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl ProgressSink for RecordingSink {
    fn log(&self, line: &str) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push(line.to_owned());
        }
    }
}
