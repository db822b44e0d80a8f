use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn scaleio() -> Command {
    let mut cmd = Command::cargo_bin("scaleio").unwrap();
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn offer(hostname: &str, ip: &str, attributes: &str) -> String {
    format!(
        r#"{{"id": "offer-{hostname}", "hostname": "{hostname}", "ip": "{ip}",
            "resources": [{{"name": "cpus", "scalar": 4.0}}, {{"name": "mem", "scalar": 8192.0}}],
            "attributes": [{attributes}]}}"#
    )
}

fn write_fixtures(dir: &Path) {
    let offers = [
        offer(
            "host-a",
            "10.0.0.1",
            r#"{"name": "scaleio-sds-domains", "value": "d1"},
               {"name": "scaleio-sds-d1", "value": "p1"},
               {"name": "scaleio-sds-d1-p1", "value": "/dev/sdb,/dev/sdc"}"#,
        ),
        offer("host-b", "10.0.0.2", ""),
        offer("host-c", "10.0.0.3", ""),
        offer("host-d", "10.0.0.4", ""),
    ];
    fs::write(dir.join("offers.json"), format!("[{}]", offers.join(","))).unwrap();

    let config = format!(
        "[scheduler]\nstore_dir = \"{}\"\n\n[cluster.preconfig]\ngateway = \"10.0.0.100\"\n",
        dir.join("store").display()
    );
    fs::write(dir.join("scaleio.toml"), config).unwrap();
}

#[test]
fn test_help() {
    scaleio()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ScaleIO cluster control plane"))
        .stdout(predicate::str::contains("scheduler"))
        .stdout(predicate::str::contains("decode"));
}

#[test]
fn test_decode_prints_declared_topology() {
    let temp_dir = TempDir::new().unwrap();
    write_fixtures(temp_dir.path());

    scaleio()
        .current_dir(temp_dir.path())
        .args(["decode", "--offers", "offers.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"hostname\": \"host-a\""))
        .stdout(predicate::str::contains("/dev/sdc"))
        .stdout(predicate::str::contains("\"client\": null"));
}

#[test]
fn test_select_assigns_roles_once() {
    let temp_dir = TempDir::new().unwrap();
    write_fixtures(temp_dir.path());

    scaleio()
        .current_dir(temp_dir.path())
        .args(["select", "--config", "scaleio.toml", "--offers", "offers.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mdm-primary    host-a"))
        .stdout(predicate::str::contains("mdm-secondary  host-b"))
        .stdout(predicate::str::contains("tiebreaker     host-c"))
        .stdout(predicate::str::contains("datanode       host-d"));

    assert!(temp_dir.path().join("store").join("scaleio.json").exists());

    // Zweiter Lauf: Rollen kommen aus dem Store
    scaleio()
        .current_dir(temp_dir.path())
        .args(["select", "--config", "scaleio.toml", "--offers", "offers.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mdm-primary    host-a"))
        .stdout(predicate::str::contains("datanode       host-d"));
}

#[test]
fn test_missing_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_fixtures(temp_dir.path());

    scaleio()
        .current_dir(temp_dir.path())
        .args(["select", "--config", "missing.toml", "--offers", "offers.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}
