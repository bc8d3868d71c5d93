//! Command-line behaviour that needs no registry.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn stowage(store: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("stowage").unwrap();
    cmd.env_remove("STOWAGE_STORE")
        .env_remove("RUST_LOG")
        .arg("--store")
        .arg(store.path());
    cmd
}

#[test]
fn help_lists_commands() {
    let store = TempDir::new().unwrap();
    stowage(&store)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pull"))
        .stdout(predicate::str::contains("push"))
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("stat"));
}

#[test]
fn digest_of_file() {
    let store = TempDir::new().unwrap();
    let file = store.path().join("hello.txt");
    std::fs::write(&file, "hello").unwrap();

    stowage(&store)
        .arg("digest")
        .arg(&file)
        .assert()
        .success()
        .stdout(format!("{HELLO}\t5\n"));
}

#[test]
fn stat_finds_stored_blob() {
    let store = TempDir::new().unwrap();
    let blobs = store.path().join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs).unwrap();
    std::fs::write(blobs.join(HELLO.trim_start_matches("sha256:")), "hello").unwrap();

    stowage(&store)
        .args(["stat", HELLO])
        .assert()
        .success()
        .stdout(predicate::str::contains("blob\t5"));

    // Blobs and manifests are separate namespaces.
    stowage(&store)
        .args(["stat", HELLO, "--manifest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn stat_rejects_malformed_digest() {
    let store = TempDir::new().unwrap();
    stowage(&store)
        .args(["stat", "sha256:nothex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid digest"));
}

#[test]
fn resolve_rejects_malformed_reference() {
    let store = TempDir::new().unwrap();
    stowage(&store)
        .args(["resolve", "Registry.example.com/UPPER:v1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid reference"));
}
