//! `aws-sdk-ec2` implementation of the cloud client adapter.
//!
//! Each method is a single translated SDK call. Provider error codes are
//! preserved verbatim in [`Ec2Error::Api`] so the lifecycle primitives can
//! recognise the idempotency cases they are allowed to swallow.

use async_trait::async_trait;
use aws_sdk_ec2::config::{BehaviorVersion, Credentials as SdkCredentials, Region};
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    CreateVolumePermission, CreateVolumePermissionModifications, Filter, InstanceType,
    IpPermission, IpRange, Placement, PermissionGroup, RequestSpotLaunchSpecification,
    SnapshotAttributeName, SpotPlacement, Tag,
};

use crate::api::types::{
    CreatedKeyPair, ElasticAddress, IngressRule, InstanceDescription, LaunchSpecification,
    SnapshotDescription, SpotRequestDescription, Tags, VolumeAttachment, VolumeDescription,
};
use crate::api::{Credentials, Ec2Api};
use crate::error::Ec2Error;

const WORLD_CIDR: &str = "0.0.0.0/0";

/// EC2 control-plane client backed by the official SDK.
#[derive(Clone, Debug)]
pub struct AwsEc2 {
    client: aws_sdk_ec2::Client,
}

impl AwsEc2 {
    /// Connects with explicit credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2Error::Config`] when the credential pair is incomplete.
    pub fn connect(credentials: &Credentials, region: &str) -> Result<Self, Ec2Error> {
        if !credentials.is_complete() {
            return Err(Ec2Error::Config(String::from(
                "both an access key and a secret key are required to connect",
            )));
        }
        let config = aws_sdk_ec2::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .credentials_provider(SdkCredentials::new(
                credentials.access_key.clone(),
                credentials.secret_key.clone(),
                None,
                None,
                "ec2-manager",
            ))
            .build();
        Ok(Self {
            client: aws_sdk_ec2::Client::from_conf(config),
        })
    }

    /// Connects through the AWS default credential provider chain
    /// (environment, shared config, instance profile).
    pub async fn connect_with_default_chain(region: &str) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        Self {
            client: aws_sdk_ec2::Client::new(&shared),
        }
    }

    fn api_error<E>(action: &str, err: &SdkError<E>) -> Ec2Error
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let code = err.code().map(str::to_owned);
        let message = err
            .message()
            .map_or_else(|| err.to_string(), str::to_owned);
        tracing::debug!(action, code = code.as_deref(), "EC2 call failed: {message}");
        Ec2Error::Api {
            action: action.to_owned(),
            code,
            message,
        }
    }

    fn missing_field(action: &str, field: &str) -> Ec2Error {
        Ec2Error::Api {
            action: action.to_owned(),
            code: None,
            message: format!("response was missing {field}"),
        }
    }

    fn tags_from(raw: &[Tag]) -> Tags {
        raw.iter()
            .filter_map(|tag| Some((tag.key()?.to_owned(), tag.value()?.to_owned())))
            .collect()
    }

    fn instance_description(instance: &aws_sdk_ec2::types::Instance) -> InstanceDescription {
        InstanceDescription {
            id: instance.instance_id().unwrap_or_default().to_owned(),
            state: instance
                .state()
                .and_then(|state| state.name())
                .map_or_else(|| String::from("unknown"), |name| name.as_str().to_owned()),
            public_ip: instance.public_ip_address().map(str::to_owned),
            availability_zone: instance
                .placement()
                .and_then(|placement| placement.availability_zone())
                .map(str::to_owned),
            security_groups: instance
                .security_groups()
                .iter()
                .filter_map(|group| group.group_name())
                .map(str::to_owned)
                .collect(),
            key_name: instance.key_name().map(str::to_owned),
            tags: Self::tags_from(instance.tags()),
        }
    }

    fn volume_description(volume: &aws_sdk_ec2::types::Volume) -> VolumeDescription {
        VolumeDescription {
            id: volume.volume_id().unwrap_or_default().to_owned(),
            state: volume
                .state()
                .map_or_else(|| String::from("unknown"), |state| state.as_str().to_owned()),
            attachments: volume
                .attachments()
                .iter()
                .filter_map(|attachment| {
                    Some(VolumeAttachment {
                        instance_id: attachment.instance_id()?.to_owned(),
                        device: attachment.device()?.to_owned(),
                        state: attachment
                            .state()
                            .map_or_else(|| String::from("unknown"), |s| s.as_str().to_owned()),
                    })
                })
                .collect(),
            tags: Self::tags_from(volume.tags()),
        }
    }

    fn ip_permission(rule: &IngressRule) -> IpPermission {
        IpPermission::builder()
            .ip_protocol(&rule.protocol)
            .from_port(rule.from_port)
            .to_port(rule.to_port)
            .ip_ranges(IpRange::builder().cidr_ip(WORLD_CIDR).build())
            .build()
    }
}

#[async_trait]
impl Ec2Api for AwsEc2 {
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<String, Ec2Error> {
        tracing::debug!(name, "creating security group");
        let output = self
            .client
            .create_security_group()
            .group_name(name)
            .description(description)
            .send()
            .await
            .map_err(|err| Self::api_error("CreateSecurityGroup", &err))?;
        output
            .group_id()
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("CreateSecurityGroup", "group id"))
    }

    async fn delete_security_group(&self, name: &str) -> Result<(), Ec2Error> {
        tracing::debug!(name, "deleting security group");
        self.client
            .delete_security_group()
            .group_name(name)
            .send()
            .await
            .map_err(|err| Self::api_error("DeleteSecurityGroup", &err))?;
        Ok(())
    }

    async fn authorize_ingress(&self, group: &str, rules: &[IngressRule]) -> Result<(), Ec2Error> {
        let mut request = self
            .client
            .authorize_security_group_ingress()
            .group_name(group);
        for rule in rules {
            request = request.ip_permissions(Self::ip_permission(rule));
        }
        request
            .send()
            .await
            .map_err(|err| Self::api_error("AuthorizeSecurityGroupIngress", &err))?;
        Ok(())
    }

    async fn create_key_pair(&self, name: &str) -> Result<CreatedKeyPair, Ec2Error> {
        tracing::debug!(name, "creating key pair");
        let output = self
            .client
            .create_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(|err| Self::api_error("CreateKeyPair", &err))?;
        let material = output
            .key_material()
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("CreateKeyPair", "key material"))?;
        let fingerprint = output
            .key_fingerprint()
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("CreateKeyPair", "key fingerprint"))?;
        Ok(CreatedKeyPair {
            name: output.key_name().unwrap_or(name).to_owned(),
            material,
            fingerprint,
        })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), Ec2Error> {
        self.client
            .delete_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(|err| Self::api_error("DeleteKeyPair", &err))?;
        Ok(())
    }

    async fn find_key_pair_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, Ec2Error> {
        let output = self
            .client
            .describe_key_pairs()
            .filters(Filter::builder().name("fingerprint").values(fingerprint).build())
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeKeyPairs", &err))?;
        Ok(output
            .key_pairs()
            .iter()
            .find_map(|pair| pair.key_name().map(str::to_owned)))
    }

    async fn run_instance(&self, launch: &LaunchSpecification) -> Result<String, Ec2Error> {
        tracing::debug!(image = launch.image_id, size = launch.size_class, "launching instance");
        let mut request = self
            .client
            .run_instances()
            .image_id(&launch.image_id)
            .instance_type(InstanceType::from(launch.size_class.as_str()))
            .min_count(1)
            .max_count(1)
            .key_name(&launch.key_name)
            .security_groups(&launch.security_group);
        if let Some(zone) = &launch.availability_zone {
            request = request.placement(Placement::builder().availability_zone(zone).build());
        }
        let output = request
            .send()
            .await
            .map_err(|err| Self::api_error("RunInstances", &err))?;
        output
            .instances()
            .first()
            .and_then(|instance| instance.instance_id())
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("RunInstances", "instance id"))
    }

    async fn request_spot_instance(
        &self,
        bid_price: &str,
        launch: &LaunchSpecification,
    ) -> Result<String, Ec2Error> {
        tracing::debug!(bid = bid_price, image = launch.image_id, "submitting spot bid");
        let mut spec = RequestSpotLaunchSpecification::builder()
            .image_id(&launch.image_id)
            .instance_type(InstanceType::from(launch.size_class.as_str()))
            .key_name(&launch.key_name)
            .security_groups(&launch.security_group);
        if let Some(zone) = &launch.availability_zone {
            spec = spec.placement(SpotPlacement::builder().availability_zone(zone).build());
        }
        let output = self
            .client
            .request_spot_instances()
            .spot_price(bid_price)
            .instance_count(1)
            .launch_specification(spec.build())
            .send()
            .await
            .map_err(|err| Self::api_error("RequestSpotInstances", &err))?;
        output
            .spot_instance_requests()
            .first()
            .and_then(|request| request.spot_instance_request_id())
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("RequestSpotInstances", "spot request id"))
    }

    async fn describe_spot_request(
        &self,
        id: &str,
    ) -> Result<SpotRequestDescription, Ec2Error> {
        let output = self
            .client
            .describe_spot_instance_requests()
            .spot_instance_request_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeSpotInstanceRequests", &err))?;
        let request = output
            .spot_instance_requests()
            .first()
            .ok_or_else(|| Self::missing_field("DescribeSpotInstanceRequests", "request"))?;
        Ok(SpotRequestDescription {
            id: request.spot_instance_request_id().unwrap_or(id).to_owned(),
            state: request
                .state()
                .map_or_else(|| String::from("unknown"), |state| state.as_str().to_owned()),
            instance_id: request.instance_id().map(str::to_owned),
        })
    }

    async fn cancel_spot_request(&self, id: &str) -> Result<(), Ec2Error> {
        self.client
            .cancel_spot_instance_requests()
            .spot_instance_request_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("CancelSpotInstanceRequests", &err))?;
        Ok(())
    }

    async fn describe_instance(
        &self,
        id: &str,
    ) -> Result<Option<InstanceDescription>, Ec2Error> {
        let output = self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeInstances", &err))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances().iter())
            .next()
            .map(Self::instance_description))
    }

    async fn describe_instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceDescription>, Ec2Error> {
        let output = self
            .client
            .describe_instances()
            .filters(Filter::builder().name(format!("tag:{key}")).values(value).build())
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeInstances", &err))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances().iter())
            .map(Self::instance_description)
            .filter(|description| description.state != "terminated")
            .collect())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceDescription>, Ec2Error> {
        let output = self
            .client
            .describe_instances()
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeInstances", &err))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances().iter())
            .map(Self::instance_description)
            .filter(|description| description.state != "terminated")
            .collect())
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), Ec2Error> {
        tracing::debug!(id, "terminating instance");
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("TerminateInstances", &err))?;
        Ok(())
    }

    async fn reboot_instance(&self, id: &str) -> Result<(), Ec2Error> {
        tracing::debug!(id, "rebooting instance");
        self.client
            .reboot_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("RebootInstances", &err))?;
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), Ec2Error> {
        let mut request = self.client.create_tags().resources(resource_id);
        for (key, value) in tags {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }
        request
            .send()
            .await
            .map_err(|err| Self::api_error("CreateTags", &err))?;
        Ok(())
    }

    async fn allocate_address(&self) -> Result<ElasticAddress, Ec2Error> {
        let output = self
            .client
            .allocate_address()
            .send()
            .await
            .map_err(|err| Self::api_error("AllocateAddress", &err))?;
        let public_ip = output
            .public_ip()
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("AllocateAddress", "public ip"))?;
        Ok(ElasticAddress {
            public_ip,
            allocation_id: output.allocation_id().map(str::to_owned),
        })
    }

    async fn associate_address(
        &self,
        instance_id: &str,
        address: &ElasticAddress,
    ) -> Result<(), Ec2Error> {
        let mut request = self.client.associate_address().instance_id(instance_id);
        request = match &address.allocation_id {
            Some(allocation_id) => request.allocation_id(allocation_id),
            None => request.public_ip(&address.public_ip),
        };
        request
            .send()
            .await
            .map_err(|err| Self::api_error("AssociateAddress", &err))?;
        Ok(())
    }

    async fn disassociate_address(&self, address: &ElasticAddress) -> Result<(), Ec2Error> {
        self.client
            .disassociate_address()
            .public_ip(&address.public_ip)
            .send()
            .await
            .map_err(|err| Self::api_error("DisassociateAddress", &err))?;
        Ok(())
    }

    async fn release_address(&self, address: &ElasticAddress) -> Result<(), Ec2Error> {
        let mut request = self.client.release_address();
        request = match &address.allocation_id {
            Some(allocation_id) => request.allocation_id(allocation_id),
            None => request.public_ip(&address.public_ip),
        };
        request
            .send()
            .await
            .map_err(|err| Self::api_error("ReleaseAddress", &err))?;
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        availability_zone: &str,
    ) -> Result<String, Ec2Error> {
        tracing::debug!(snapshot_id, availability_zone, "creating volume from snapshot");
        let output = self
            .client
            .create_volume()
            .snapshot_id(snapshot_id)
            .availability_zone(availability_zone)
            .send()
            .await
            .map_err(|err| Self::api_error("CreateVolume", &err))?;
        output
            .volume_id()
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("CreateVolume", "volume id"))
    }

    async fn describe_volume(&self, id: &str) -> Result<Option<VolumeDescription>, Ec2Error> {
        let output = self
            .client
            .describe_volumes()
            .volume_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeVolumes", &err))?;
        Ok(output.volumes().first().map(Self::volume_description))
    }

    async fn describe_volumes_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<VolumeDescription>, Ec2Error> {
        let output = self
            .client
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeVolumes", &err))?;
        Ok(output.volumes().iter().map(Self::volume_description).collect())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), Ec2Error> {
        tracing::debug!(volume_id, instance_id, device, "attaching volume");
        self.client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|err| Self::api_error("AttachVolume", &err))?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<(), Ec2Error> {
        tracing::debug!(volume_id, instance_id, "detaching volume");
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(|err| Self::api_error("DetachVolume", &err))?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), Ec2Error> {
        tracing::debug!(volume_id, "deleting volume");
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|err| Self::api_error("DeleteVolume", &err))?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<String, Ec2Error> {
        let output = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .description(description)
            .send()
            .await
            .map_err(|err| Self::api_error("CreateSnapshot", &err))?;
        output
            .snapshot_id()
            .map(str::to_owned)
            .ok_or_else(|| Self::missing_field("CreateSnapshot", "snapshot id"))
    }

    async fn describe_snapshot(
        &self,
        id: &str,
    ) -> Result<Option<SnapshotDescription>, Ec2Error> {
        let output = self
            .client
            .describe_snapshots()
            .snapshot_ids(id)
            .send()
            .await
            .map_err(|err| Self::api_error("DescribeSnapshots", &err))?;
        Ok(output.snapshots().first().map(|snapshot| SnapshotDescription {
            id: snapshot.snapshot_id().unwrap_or(id).to_owned(),
            state: snapshot
                .state()
                .map_or_else(|| String::from("unknown"), |state| state.as_str().to_owned()),
        }))
    }

    async fn make_snapshot_public(&self, id: &str) -> Result<(), Ec2Error> {
        self.client
            .modify_snapshot_attribute()
            .snapshot_id(id)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .create_volume_permission(
                CreateVolumePermissionModifications::builder()
                    .add(
                        CreateVolumePermission::builder()
                            .group(PermissionGroup::All)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Self::api_error("ModifySnapshotAttribute", &err))?;
        Ok(())
    }
}
