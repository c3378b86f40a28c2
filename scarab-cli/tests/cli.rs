//! CLI surface tests: help/version output and the missing-core-image
//! failure path, exercised as an external process the way the teacher's
//! `faxc-drv` end-to-end suite drives its own binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn scarab_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_scarab"))
}

#[test]
fn help_lists_core_flag() {
    scarab_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--core"));
}

#[test]
fn version_reports_package_version() {
    scarab_bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_core_image_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    scarab_bin()
        .current_dir(dir.path())
        .env_remove("SCARAB_CORE")
        .assert()
        .failure()
        .code(1);
}
