//! Integration tests for CLI commands

#![allow(deprecated)]

use assert_cmd::{assert::OutputAssertExt, cargo::CommandCargoExt};
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

/// Config pointing storage into a temp dir and the broker at a dead port
fn write_config(tmp: &TempDir) -> std::path::PathBuf {
    let path = tmp.path().join("config.toml");
    let content = format!(
        r#"
[broker]
base_url = "http://127.0.0.1:9"
request_timeout_secs = 1

[azure]
client_id = "client-id"

[storage]
database_path = "{}"
key_path = "{}"
"#,
        tmp.path().join("token_cache.db").display(),
        tmp.path().join("encryption.key").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn azauth(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("azauth").unwrap();
    cmd.arg("--config")
        .arg(config)
        .env_remove("AZURE_BROKER_AUTH_KEY");
    cmd
}

#[test]
fn test_login_command_help() {
    let mut cmd = Command::cargo_bin("azauth").unwrap();
    cmd.arg("login").arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Authenticate and print the connection auth descriptor"))
        .stdout(predicate::str::contains("--no-browser"));
}

#[test]
fn test_types_lists_supported_auth() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    azauth(&config)
        .arg("types")
        .assert()
        .success()
        .stdout(predicate::str::contains("Azure AD SSO"))
        .stdout(predicate::str::contains("Azure Service Principal Secret"));
}

#[test]
fn test_account_add_then_show() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    let output = azauth(&config).args(["account", "add"]).output().unwrap();
    assert!(output.status.success());
    let id = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert_eq!(id, "1");

    azauth(&config)
        .args(["account", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("none"));

    assert!(tmp.path().join("encryption.key").exists());
}

#[test]
fn test_show_unknown_account_fails() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    azauth(&config)
        .args(["account", "show", "7"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No token cache entry found"));
}

#[test]
fn test_password_login_prints_masked_descriptor() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    azauth(&config).args(["account", "add"]).assert().success();

    azauth(&config)
        .args([
            "login",
            "1",
            "--type",
            "password",
            "--user",
            "dba@contoso.com",
            "--password",
            "hunter2hunter2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("azure-active-directory-password"))
        .stdout(predicate::str::contains("hunter***"))
        .stdout(predicate::str::contains("hunter2hunter2").not());
}

#[test]
fn test_interactive_login_reports_unreachable_broker() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp);

    azauth(&config).args(["account", "add"]).assert().success();

    azauth(&config)
        .args(["login", "1", "--no-browser"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cloud token broker unavailable"));
}

#[test]
fn test_non_interactive_login_needs_no_client_id() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("config.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndatabase_path = \"{}\"\nkey_path = \"{}\"\n",
            tmp.path().join("token_cache.db").display(),
            tmp.path().join("encryption.key").display()
        ),
    )
    .unwrap();

    azauth(&config)
        .args([
            "login",
            "1",
            "--type",
            "service-principal-secret",
            "--tenant",
            "tenant-1",
            "--client-secret",
            "sp-secret-value",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("azure-active-directory-service-principal-secret"))
        .stdout(predicate::str::contains("sp-sec***"))
        .stdout(predicate::str::contains("clientId").not());
}
