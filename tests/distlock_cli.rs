//! End-to-end CLI tests for `distlock`.
//!
//! None of these reach a real etcd: every run points at a closed local port.

use anyhow::ensure;
use std::process::{Command, Output};

const UNREACHABLE: &str = "http://127.0.0.1:1";

fn distlock(args: &[&str]) -> anyhow::Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_distlock"))
        .args(args)
        .env("DISTLOCK_ENDPOINTS", UNREACHABLE)
        .env("DISTLOCK_DIAL_TIMEOUT", "1")
        .env_remove("DISTLOCK_TTL")
        .env_remove("RUST_LOG")
        .output()?)
}

fn expect_usage_error(args: &[&str], message: &str) -> anyhow::Result<()> {
    let output = distlock(args)?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    ensure!(
        output.status.code() == Some(2),
        "expected usage exit code, got {:?}: {stderr}",
        output.status.code()
    );
    ensure!(
        stderr.contains(message),
        "stderr does not mention `{message}`: {stderr}"
    );
    ensure!(
        !stderr.contains("coordination service"),
        "usage error reached the network: {stderr}"
    );
    Ok(())
}

#[test]
fn nowait_with_timeout_is_rejected_before_network() -> anyhow::Result<()> {
    expect_usage_error(
        &["--lock-name", "db", "--nowait", "--timeout", "5", "--", "true"],
        "Conflicting options -nowait and -timeout.",
    )
}

#[test]
fn lock_name_is_required() -> anyhow::Result<()> {
    expect_usage_error(&["--lock"], "'lock-name' is a required option.")?;
    expect_usage_error(&["--lock-name", "", "--lock"], "'lock-name' is a required option.")
}

#[test]
fn lock_and_unlock_conflict() -> anyhow::Result<()> {
    expect_usage_error(
        &["--lock-name", "db", "--lock", "--unlock"],
        "Can't give both 'lock' and 'unlock' options.",
    )
}

#[test]
fn command_with_lock_only_is_rejected() -> anyhow::Result<()> {
    expect_usage_error(
        &["--lock-name", "db", "--unlock", "ls", "-l"],
        "Program args given, but would not execute.",
    )
}

#[test]
fn missing_command_is_rejected() -> anyhow::Result<()> {
    expect_usage_error(
        &["--lock-name", "db", "--timeout", "3"],
        "Missing command to protect with lock",
    )
}

#[test]
fn zero_ttl_is_rejected() -> anyhow::Result<()> {
    expect_usage_error(
        &["--lock-name", "db", "--ttl", "0", "--lock"],
        "'ttl' must be at least 1 second",
    )
}

#[test]
fn unreachable_service_is_fatal_and_command_never_runs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let marker = dir.path().join("ran");
    let marker_arg = marker.to_string_lossy().to_string();

    let output = distlock(&["--lock-name", "db", "--", "touch", &marker_arg])?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    ensure!(
        output.status.code() == Some(1),
        "expected failure exit code, got {:?}: {stderr}",
        output.status.code()
    );
    ensure!(stderr.contains("coordination service"), "stderr: {stderr}");
    ensure!(!marker.exists(), "command ran without the lock");
    ensure!(output.stdout.is_empty());
    Ok(())
}

#[test]
fn unlock_against_unreachable_service_fails() -> anyhow::Result<()> {
    let output = distlock(&["--lock-name", "db", "--unlock", "--json"])?;
    ensure!(output.status.code() == Some(1));
    ensure!(output.stdout.is_empty(), "report printed for a failed unlock");
    Ok(())
}
