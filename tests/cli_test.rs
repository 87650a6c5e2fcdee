mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::commands_csv;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("escrow-ledger"));
    cmd.arg("tests/fixtures/lifecycle.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("wallet,available,pending,total,currency"))
        // prov-1: one approved order paid out, one cancelled
        .stdout(predicate::str::contains("prov-1,0,0,0,USD"))
        // prov-2: approved below the payout threshold, one order still in escrow
        .stdout(predicate::str::contains("prov-2,4000,2500,6500,USD"));

    Ok(())
}

#[test]
fn test_cli_reports_bad_rows_and_continues() {
    let csv = commands_csv(&[
        "package,,prov-1,logo,,,",
        "create,o1,cust-1,logo,7000,,",
        "approve,o1,cust-1,,,,",
        "teleport,o1,cust-1,,,,",
        "accept,o1,prov-1,,,,",
    ]);

    Command::new(cargo_bin!("escrow-ledger"))
        .arg(csv.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Error processing command:"))
        .stderr(predicate::str::contains("Error reading command:"))
        .stdout(predicate::str::contains("prov-1,0,7000,7000,USD"));
}

#[test]
fn test_cli_applies_config_file() {
    let csv = commands_csv(&[
        "package,,prov-1,logo,,,",
        "create,o1,cust-1,logo,10000,,",
        "accept,o1,prov-1,,,,",
        "deliver,o1,prov-1,,,,file",
        "approve,o1,cust-1,,,,",
    ]);
    let mut config = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(config, "currency = \"EUR\"\n[fees]\nrate = \"0.1\"").unwrap();

    Command::new(cargo_bin!("escrow-ledger"))
        .arg(csv.path())
        .arg("--config")
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("prov-1,9000,0,9000,EUR"));
}

#[test]
fn test_cli_missing_input_fails() {
    Command::new(cargo_bin!("escrow-ledger"))
        .arg("tests/fixtures/does-not-exist.csv")
        .assert()
        .failure();
}
