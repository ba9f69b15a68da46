//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::api::Credentials;
use crate::instance::InstanceSpecification;

/// EC2 manager configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "EC2M")]
pub struct ManagerConfig {
    /// AWS access key identifier. Optional; when absent the AWS default
    /// credential provider chain is used instead.
    pub access_key: Option<String>,
    /// AWS secret access key. Optional; paired with `access_key`.
    pub secret_key: Option<String>,
    /// Region to operate in. Defaults to `us-east-1`.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Machine image launched when no image is given on the command line.
    pub default_image_id: String,
    /// Instance size class. Defaults to `t2.micro` to minimise cost.
    #[ortho_config(default = "t2.micro".to_owned())]
    pub default_size_class: String,
    /// Availability zone to pin instances to. Optional; the provider picks
    /// one when unset.
    pub default_availability_zone: Option<String>,
    /// Maximum hourly spot bid. Optional; instances launch on-demand when
    /// unset.
    pub default_spot_bid: Option<String>,
    /// Path of the JSON file holding the reusable SSH private key.
    #[ortho_config(default = "ec2-manager-key.json".to_owned())]
    pub key_store_path: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

impl ManagerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in ec2-manager.toml",
                metadata.description, metadata.env_var, metadata.toml_key, metadata.section
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("ec2-manager")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the explicit credential pair, when both halves are present.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        match (self.access_key.as_deref(), self.secret_key.as_deref()) {
            (Some(access), Some(secret))
                if !access.trim().is_empty() && !secret.trim().is_empty() =>
            Some(Credentials {
                access_key: access.to_owned(),
                secret_key: secret.to_owned(),
            }),
            _ => None,
        }
    }

    /// Builds an [`InstanceSpecification`] from the configured defaults,
    /// overridden by any explicitly supplied image.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_specification(
        &self,
        image_override: Option<&str>,
    ) -> Result<InstanceSpecification, ConfigError> {
        self.validate()?;
        let image_id = image_override.unwrap_or(&self.default_image_id).to_owned();
        Ok(InstanceSpecification {
            image_id,
            size_class: self.default_size_class.clone(),
            availability_zone: self.default_availability_zone.clone(),
            spot_bid_price: self.default_spot_bid.clone(),
        })
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values via environment
    /// variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.default_image_id,
            &FieldMetadata::new(
                "machine image",
                "EC2M_DEFAULT_IMAGE_ID",
                "default_image_id",
                "ec2-manager",
            ),
        )?;
        Self::require_field(
            &self.region,
            &FieldMetadata::new("AWS region", "EC2M_REGION", "region", "ec2-manager"),
        )?;
        Self::require_field(
            &self.default_size_class,
            &FieldMetadata::new(
                "instance size class",
                "EC2M_DEFAULT_SIZE_CLASS",
                "default_size_class",
                "ec2-manager",
            ),
        )?;
        Self::require_field(
            &self.key_store_path,
            &FieldMetadata::new(
                "key store path",
                "EC2M_KEY_STORE_PATH",
                "key_store_path",
                "ec2-manager",
            ),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ManagerConfig {
        ManagerConfig {
            access_key: None,
            secret_key: None,
            region: String::from("us-east-1"),
            default_image_id: String::from("ami-base"),
            default_size_class: String::from("t2.micro"),
            default_availability_zone: None,
            default_spot_bid: None,
            key_store_path: String::from("ec2-manager-key.json"),
        }
    }

    #[test]
    fn validation_rejects_a_blank_image() {
        let config = ManagerConfig {
            default_image_id: String::from("  "),
            ..config()
        };
        let err = config.validate().expect_err("blank image must be rejected");
        assert!(matches!(err, ConfigError::MissingField(_)), "got {err:?}");
    }

    #[test]
    fn credentials_require_both_halves() {
        let mut config = config();
        assert!(config.credentials().is_none());

        config.access_key = Some(String::from("AKIA123"));
        assert!(config.credentials().is_none(), "secret is still missing");

        config.secret_key = Some(String::from("secret"));
        let credentials = config.credentials().expect("both halves present");
        assert!(credentials.is_complete());
    }

    #[test]
    fn blank_credential_halves_fall_back_to_the_provider_chain() {
        let blank = ManagerConfig {
            access_key: Some(String::from("AKIA123")),
            secret_key: Some(String::from("  ")),
            ..config()
        };
        assert!(blank.credentials().is_none(), "a blank secret is no secret");

        let reversed = ManagerConfig {
            access_key: Some(String::from("")),
            secret_key: Some(String::from("secret")),
            ..config()
        };
        assert!(reversed.credentials().is_none());
    }

    #[test]
    fn specification_prefers_the_image_override() {
        let spec = config()
            .as_specification(Some("ami-override"))
            .expect("valid config");
        assert_eq!(spec.image_id, "ami-override");
        assert!(!spec.is_spot());
    }
}
