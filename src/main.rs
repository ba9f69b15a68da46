//! Binary entry point for the EC2 manager CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ec2_manager::api::TAG_NAME;
use ec2_manager::{
    AwsEc2, ConfigError, Ec2Error, FileKeyStore, Instance, InstanceSpecification, ManagerConfig,
    TracingSink,
};

#[derive(Debug, Parser)]
#[command(
    name = "ec2-manager",
    about = "Provision and tear down EC2 instances with transactional rollback",
    arg_required_else_help = true
)]
enum Cli {
    #[command(name = "create", about = "Provision a new instance and its resources")]
    Create(CreateCommand),
    #[command(name = "destroy", about = "Tear down a managed instance by name")]
    Destroy(DestroyCommand),
    #[command(name = "list", about = "List instances managed by this tool")]
    List,
}

#[derive(Debug, Parser)]
struct CreateCommand {
    /// Display name for the new instance.
    name: String,
    /// Machine image to launch; overrides the configured default.
    #[arg(long)]
    image: Option<String>,
    /// Instance size class; overrides the configured default.
    #[arg(long)]
    size_class: Option<String>,
    /// Availability zone to pin the instance to.
    #[arg(long)]
    availability_zone: Option<String>,
    /// Maximum hourly spot bid; when set the instance launches as a spot bid.
    #[arg(long)]
    spot_bid: Option<String>,
}

#[derive(Debug, Parser)]
struct DestroyCommand {
    /// Display name of the instance to destroy.
    name: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("no managed instance is named '{0}'")]
    UnknownInstance(String),
    #[error(transparent)]
    Lifecycle(#[from] Ec2Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = ManagerConfig::load_without_cli_args()?;
    let cancel = cancel_on_ctrl_c();
    match cli {
        Cli::Create(command) => create_command(&config, command, &cancel).await,
        Cli::Destroy(command) => destroy_command(&config, &command.name, &cancel).await,
        Cli::List => list_command(&config).await,
    }
}

/// Returns a token that trips when the user interrupts the process, so an
/// in-flight workflow can unwind instead of leaking half-built resources.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; rolling back");
            trigger.cancel();
        }
    });
    cancel
}

async fn connect(config: &ManagerConfig) -> Result<AwsEc2, CliError> {
    match config.credentials() {
        Some(credentials) => Ok(AwsEc2::connect(&credentials, &config.region)?),
        None => Ok(AwsEc2::connect_with_default_chain(&config.region).await),
    }
}

async fn create_command(
    config: &ManagerConfig,
    command: CreateCommand,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let mut spec = config.as_specification(command.image.as_deref())?;
    if let Some(size_class) = command.size_class {
        spec.size_class = size_class;
    }
    if let Some(zone) = command.availability_zone {
        spec.availability_zone = Some(zone);
    }
    if let Some(bid) = command.spot_bid {
        spec.spot_bid_price = Some(bid);
    }

    let client = Arc::new(connect(config).await?);
    let key_store = FileKeyStore::new(config.key_store_path.as_str());
    let mut instance = Instance::new(client, command.name, spec);
    instance.create(&key_store, &TracingSink, cancel).await?;

    let mut stdout = io::stdout();
    writeln!(
        stdout,
        "{}\t{}\t{}",
        instance.name(),
        instance.instance_id().unwrap_or("-"),
        instance.public_ip().unwrap_or("-"),
    )
    .ok();
    Ok(())
}

async fn destroy_command(
    config: &ManagerConfig,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let client = Arc::new(connect(config).await?);
    let description = Instance::list_managed(client.as_ref())
        .await?
        .into_iter()
        .find(|candidate| candidate.state != "terminated" && candidate.tag(TAG_NAME) == Some(name))
        .ok_or_else(|| CliError::UnknownInstance(name.to_owned()))?;

    // Launch parameters are irrelevant here; destroy never reads them.
    let spec = InstanceSpecification {
        image_id: config.default_image_id.clone(),
        size_class: config.default_size_class.clone(),
        availability_zone: None,
        spot_bid_price: None,
    };
    let mut instance = Instance::reconnect(client, &description, spec).await?;
    instance.destroy(&TracingSink, cancel).await?;
    Ok(())
}

async fn list_command(config: &ManagerConfig) -> Result<(), CliError> {
    let client = connect(config).await?;
    let managed = Instance::<AwsEc2>::list_managed(&client).await?;

    let mut stdout = io::stdout();
    for description in managed {
        writeln!(
            stdout,
            "{}\t{}\t{}\t{}",
            description.tag(TAG_NAME).unwrap_or("-"),
            description.id,
            description.state,
            description.public_ip.as_deref().unwrap_or("-"),
        )
        .ok();
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_renders_the_message() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::UnknownInstance(String::from("web")));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(rendered.contains("no managed instance is named 'web'"), "{rendered}");
    }

    #[test]
    fn cli_parses_a_spot_create() {
        let cli = Cli::try_parse_from([
            "ec2-manager",
            "create",
            "web",
            "--image",
            "ami-123",
            "--spot-bid",
            "0.05",
        ])
        .unwrap_or_else(|err| panic!("parse: {err}"));
        match cli {
            Cli::Create(command) => {
                assert_eq!(command.name, "web");
                assert_eq!(command.image.as_deref(), Some("ami-123"));
                assert_eq!(command.spot_bid.as_deref(), Some("0.05"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
