//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = cargo_bin_cmd!("ec2-manager");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("destroy"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn bare_invocation_prints_usage_and_fails() {
    let mut cmd = cargo_bin_cmd!("ec2-manager");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn unknown_subcommands_are_rejected() {
    let mut cmd = cargo_bin_cmd!("ec2-manager");
    cmd.arg("resize");
    cmd.assert().failure();
}
