//! Integration tests for kosmosctl
//!
//! Every command runs against the simulated instrument except `status`,
//! which only checks the unreachable-link path.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn kosmosctl() -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("kosmosctl")?;
    cmd.env_remove("KOSMOS_CONFIG")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    Ok(cmd)
}

fn write_config(dir: &TempDir, name: &str, content: &str) -> Result<PathBuf, std::io::Error> {
    let path = dir.path().join(name);
    fs::write(&path, content)?;
    Ok(path)
}

fn stdout_json(cmd: &mut Command) -> Result<Value, Box<dyn std::error::Error>> {
    let output = cmd.output()?;
    Ok(serde_json::from_slice(&output.stdout)?)
}

const BENCH_YAML: &str = "\
fpga:
  clock_period_ns: 10
tree:
  modules:
    - kind: kbd_matrix
      rows: 16
      cols: 8
    - kind: led_spy
      instance_id: 1
      msg_id: 20
";

#[test]
fn test_cli_help() -> TestResult {
    kosmosctl()?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hardware-in-the-loop"));
    Ok(())
}

#[test]
fn test_cli_version() -> TestResult {
    kosmosctl()?
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("kosmosctl"));
    Ok(())
}

#[test]
fn test_completion_generation() -> TestResult {
    kosmosctl()?
        .args(["completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_kosmosctl"));
    Ok(())
}

#[test]
fn test_validate_yaml_config() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(&dir, "bench.yaml", BENCH_YAML)?;
    kosmosctl()?
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("KBD_MATRIX"))
        .stdout(predicate::str::contains("LED_SPY_1"));
    Ok(())
}

#[test]
fn test_validate_json_output() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(&dir, "bench.yaml", BENCH_YAML)?;
    let json = stdout_json(
        kosmosctl()?
            .args(["--json", "config", "validate"])
            .arg(&path),
    )?;
    assert_eq!(json["success"], true);
    assert_eq!(json["modules"][0]["name"], "KBD_MATRIX");
    assert_eq!(json["modules"][0]["msg_id"], 0x10);
    assert_eq!(json["modules"][1]["name"], "LED_SPY_1");
    assert_eq!(json["modules"][1]["msg_id"], 20);
    Ok(())
}

#[test]
fn test_duplicate_msg_id_is_rejected() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(
        &dir,
        "clash.yaml",
        "tree:\n  modules:\n    - kind: led_spy\n      msg_id: 20\n    - kind: i2c_spy\n      msg_id: 20\n",
    )?;
    kosmosctl()?
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Invalid configuration"));
    Ok(())
}

#[test]
fn test_unknown_extension_is_rejected() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(&dir, "bench.toml", "")?;
    kosmosctl()?
        .args(["--json", "config", "validate"])
        .arg(&path)
        .assert()
        .code(4)
        .stdout(predicate::str::contains("invalid_configuration"));
    Ok(())
}

#[test]
fn test_config_show_reference() -> TestResult {
    kosmosctl()?
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kind: kbd_matrix"))
        .stdout(predicate::str::contains("refill_interval_ns: 4000"));
    Ok(())
}

#[test]
fn test_tree_dump() -> TestResult {
    kosmosctl()?
        .arg("tree")
        .assert()
        .success()
        .stdout(predicate::str::contains("0x02 PES"))
        .stdout(predicate::str::contains("action 0x001 KBD_MATRIX.SEND"))
        .stdout(predicate::str::contains("resume 0x001 GO_RPI"));
    Ok(())
}

#[test]
fn test_tree_from_config_file() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(&dir, "bench.yaml", BENCH_YAML)?;
    kosmosctl()?
        .arg("tree")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("0x14 LED_SPY_1"))
        .stdout(predicate::str::contains("OPTEMU").not());
    Ok(())
}

#[test]
fn test_keystroke_demo() -> TestResult {
    let json = stdout_json(kosmosctl()?.args([
        "--json",
        "demo",
        "keystroke",
        "--key",
        "B",
        "--hold-ms",
        "5",
    ]))?;
    assert_eq!(json["success"], true);
    assert_eq!(json["reports"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["reports"][0]["keys"][0], "B");
    assert_eq!(json["reports"][1]["keys"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[test]
fn test_keystroke_demo_listing() -> TestResult {
    kosmosctl()?
        .args(["demo", "keystroke", "--hold-ms", "1", "--listing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("EXECUTE actions=0x001"))
        .stdout(predicate::str::contains("Keyboard reports:"));
    Ok(())
}

#[test]
fn test_unknown_key_fails_the_run() -> TestResult {
    kosmosctl()?
        .args(["demo", "keystroke", "--key", "NOT_A_KEY"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Error:"));
    Ok(())
}

#[test]
fn test_demo_needs_the_module() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(&dir, "spy.json", r#"{"tree": {"modules": [{"kind": "led_spy"}]}}"#)?;
    kosmosctl()?
        .args(["demo", "keystroke", "--config"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("KBD_MATRIX"));
    Ok(())
}

#[test]
fn test_sensor_demo() -> TestResult {
    let json = stdout_json(kosmosctl()?.args([
        "--json", "demo", "sensor", "--dx", "2", "--dy", "-1", "--raw",
    ]))?;
    assert_eq!(json["reports"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["reports"][0]["dx"], 2);
    assert_eq!(json["reports"][0]["dy"], -1);
    assert_eq!(json["spi"].as_array().map(Vec::len), Some(3));
    Ok(())
}

#[test]
fn test_led_demo() -> TestResult {
    kosmosctl()?
        .args(["demo", "leds"])
        .assert()
        .success()
        .stdout(predicate::str::contains("LED_SPY"))
        .stdout(predicate::str::contains("ch3"));
    Ok(())
}

#[test]
fn test_status_unreachable() -> TestResult {
    kosmosctl()?
        .args(["--json", "status", "--connect", "127.0.0.1:1"])
        .assert()
        .code(5)
        .stdout(predicate::str::contains("unreachable"));
    Ok(())
}

#[test]
fn test_tree_snapshot() -> TestResult {
    let dir = TempDir::new()?;
    let path = write_config(&dir, "bench.yaml", BENCH_YAML)?;
    let output = kosmosctl()?.arg("tree").arg("--config").arg(&path).output()?;
    let stdout = String::from_utf8(output.stdout)?;
    insta::assert_snapshot!(
        stdout.trim_end().replace('\n', "|"),
        @"0x02 PES          Pes buffer=4096 fifo=64 pending=0|0x10 KBD_MATRIX   Consumer buffer=1024 fifo=16 pending=0|0x14 LED_SPY_1    Producer buffer=1024 fifo=16 pending=0|action 0x001 KBD_MATRIX.SEND|action 0x002 LED_SPY_1.START|action 0x004 LED_SPY_1.STOP|resume 0x001 GO_RPI|resume 0x002 KBD_MATRIX.READY"
    );
    Ok(())
}
