use assert_cmd::Command;
use predicates::prelude::*;

#[test]
#[allow(deprecated)]
fn test_main_binary_help() {
    Command::cargo_bin("zabbix-extractor")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Extract Zabbix trend statistics"));
}

#[test]
#[allow(deprecated)]
fn test_run_alias_help() {
    Command::cargo_bin("zabbix-extractor-run")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Download charts and trends"));
}

#[test]
#[allow(deprecated)]
fn test_items_subcommand() {
    Command::cargo_bin("zabbix-extractor")
        .unwrap()
        .arg("items")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--common"));
}

#[test]
#[allow(deprecated)]
fn test_periods_lists_every_kind() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("zabbix-extractor")
        .unwrap()
        .env("ZABBIX_EXTRACTOR_CONFIG", tmp.path().join("absent.toml"))
        .arg("periods")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("last_30_days")
                .and(predicate::str::contains("previous_month"))
                .and(predicate::str::contains("current_month")),
        );
}

#[test]
#[allow(deprecated)]
fn test_unknown_period_is_rejected() {
    Command::cargo_bin("zabbix-extractor")
        .unwrap()
        .args(["run", "--template", "T", "--item", "CPU", "--period", "yesterday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown time range kind"));
}

#[test]
#[allow(deprecated)]
fn test_invalid_config_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[server]\nport = 1\n").unwrap();
    Command::cargo_bin("zabbix-extractor")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .arg("periods")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}
