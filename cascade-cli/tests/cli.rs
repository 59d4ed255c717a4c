use assert_cmd::Command;
use predicates::prelude::*;

fn cascli(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cascli").unwrap();
    cmd.current_dir(dir.path()).env("HOME", dir.path()).arg("-n");
    cmd
}

#[test]
fn one_shot_put_and_get() {
    let dir = tempfile::tempdir().unwrap();
    cascli(&dir)
        .arg("--query=put greet hello; get greet")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("version"));
}

#[test]
fn remove_reports_null() {
    let dir = tempfile::tempdir().unwrap();
    cascli(&dir)
        .arg("--query=put k v; remove k; get k")
        .assert()
        .success()
        .stdout(predicate::str::contains("removed"));
}

#[test]
fn status_runs_on_empty_shard() {
    let dir = tempfile::tempdir().unwrap();
    cascli(&dir)
        .arg("--query=status")
        .assert()
        .success()
        .stdout(predicate::str::contains("latest version: -1"));
}

#[test]
fn unknown_command_fails() {
    let dir = tempfile::tempdir().unwrap();
    cascli(&dir).arg("--query=frobnicate").assert().failure();
}

#[test]
fn storage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    cascli(&dir).arg("--query=put persisted value1").assert().success();
    cascli(&dir)
        .arg("--query=get persisted")
        .assert()
        .success()
        .stdout(predicate::str::contains("value1"));
}
