use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Binary with a clean environment rooted in `dir`, so no stray
/// `JOURNAL_MIRROR_*` variables or `.env` files leak in.
fn mirror(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("journal-mirror").unwrap();
    cmd.current_dir(dir.path())
        .env_clear()
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("config"));
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    mirror(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-config"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_completions_for_bash() {
    let dir = TempDir::new().unwrap();
    mirror(&dir)
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("journal-mirror"));
}

#[test]
fn test_check_config_requires_ssh_user() {
    let dir = TempDir::new().unwrap();
    mirror(&dir)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ssh_user"));
}

#[test]
fn test_check_config_rejects_unreadable_key() {
    let dir = TempDir::new().unwrap();
    mirror(&dir)
        .args(["check-config", "--ssh-user", "core", "--ssh-private-key", "missing_key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read private key"));
}

#[test]
fn test_check_config_rejects_garbage_key_from_env() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("id_ed25519"), "not a key").unwrap();
    mirror(&dir)
        .arg("check-config")
        .env("JOURNAL_MIRROR_SSH_USER", "core")
        .env("JOURNAL_MIRROR_SSH_PRIVATE_KEY", "id_ed25519")
        .assert()
        .failure()
        .stderr(predicate::str::contains("is unusable"));
}

#[test]
fn test_config_file_values_are_validated() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("mirror.toml");
    std::fs::write(
        &config,
        "ssh_user = \"core\"\nssh_private_key = \"id\"\nrequeue_base_delay = \"often\"\n",
    )
    .unwrap();
    mirror(&dir)
        .arg("check-config")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("requeue_base_delay"));
}

#[test]
fn test_run_rejects_missing_journal_directory() {
    let dir = TempDir::new().unwrap();
    mirror(&dir)
        .args([
            "run",
            "--ssh-user",
            "core",
            "--ssh-private-key",
            "id",
            "--local-journal-directory",
            "does-not-exist",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("local journal directory"));
}
