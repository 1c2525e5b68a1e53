//! End-to-end tests for the inkclock-ota binary

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn ota() -> Result<Command, Box<dyn std::error::Error>> {
    Ok(Command::cargo_bin("inkclock-ota")?)
}

fn json_output(bytes: &[u8]) -> Result<Value, Box<dyn std::error::Error>> {
    Ok(serde_json::from_slice(bytes)?)
}

struct Workspace {
    _dir: TempDir,
    keys: std::path::PathBuf,
    device: std::path::PathBuf,
    media: std::path::PathBuf,
}

impl Workspace {
    /// Key generated, device configured to trust it, signed image on the media
    fn release(image: &[u8], hardware: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let keys = dir.path().join("keys");
        let device = dir.path().join("device");
        let media = dir.path().join("sd");
        fs::create_dir_all(&device)?;
        fs::create_dir_all(&media)?;

        let out = ota()?
            .args(["--json", "keygen", "--id", "release", "--out"])
            .arg(&keys)
            .output()?;
        assert!(out.status.success());
        let trusted = json_output(&out.stdout)?["trusted_key"].clone();

        let config = serde_json::json!({
            "trusted_keys": [trusted],
            "block_size": 1024,
            "power": { "sample_interval_ms": 1 },
        });
        fs::write(device.join("update_config.json"), config.to_string())?;
        fs::write(device.join("settings.json"), r#"{"wifi.ssid":"home"}"#)?;

        fs::write(media.join("firmware.bin"), image)?;
        ota()?
            .args(["sign", "--hardware", hardware, "--version", "2.0.0", "--image"])
            .arg(media.join("firmware.bin"))
            .arg("--key")
            .arg(keys.join("release.key.json"))
            .assert()
            .success();

        Ok(Self {
            _dir: dir,
            keys,
            device,
            media,
        })
    }

    fn on_device(&self, command: &str) -> Result<Command, Box<dyn std::error::Error>> {
        let mut cmd = ota()?;
        cmd.args(["--json", command, "--device"]).arg(&self.device);
        Ok(cmd)
    }

    fn status(&self) -> Result<Value, Box<dyn std::error::Error>> {
        let out = self.on_device("status")?.output()?;
        assert!(out.status.success());
        Ok(json_output(&out.stdout)?["status"].clone())
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn apply(ws: &Workspace) -> Result<std::process::Output, Box<dyn std::error::Error>> {
    Ok(ws
        .on_device("apply-local")?
        .arg("--media")
        .arg(&ws.media)
        .output()?)
}

#[test]
fn test_sign_and_verify_release() -> TestResult {
    let ws = Workspace::release(&image(5000), "ESP32")?;
    assert!(ws.media.join("firmware_info.json").exists());

    ota()?
        .arg("--config")
        .arg(ws.device.join("update_config.json"))
        .args(["verify", "--image"])
        .arg(ws.media.join("firmware.bin"))
        .assert()
        .success()
        .stdout(predicate::str::contains("signed by release"));
    Ok(())
}

#[test]
fn test_verify_rejects_tampered_image() -> TestResult {
    let ws = Workspace::release(&image(5000), "ESP32")?;
    let mut tampered = image(5000);
    tampered[10] ^= 0x55;
    fs::write(ws.media.join("firmware.bin"), tampered)?;

    ota()?
        .arg("--config")
        .arg(ws.device.join("update_config.json"))
        .args(["verify", "--image"])
        .arg(ws.media.join("firmware.bin"))
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Release rejected"));
    Ok(())
}

#[test]
fn test_apply_boot_and_mark_valid() -> TestResult {
    let firmware = image(9000);
    let ws = Workspace::release(&firmware, "ESP32")?;

    let out = apply(&ws)?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let result = json_output(&out.stdout)?;
    assert_eq!(result["result"]["status"], "Success");
    assert_eq!(fs::read(ws.device.join("partition_b.bin"))?, firmware);

    let status = ws.status()?;
    assert_eq!(status["active"], "B");
    assert_eq!(status["on_probation"], true);

    ws.on_device("boot")?.assert().success();
    ws.on_device("mark-valid")?.assert().success();

    let status = ws.status()?;
    assert_eq!(status["active"], "B");
    assert_eq!(status["on_probation"], false);
    assert_eq!(status["snapshot_present"], false);
    Ok(())
}

#[test]
fn test_failed_boots_roll_back() -> TestResult {
    let ws = Workspace::release(&image(4000), "ESP32")?;
    assert!(apply(&ws)?.status.success());
    fs::write(ws.device.join("settings.json"), r#"{"wifi.ssid":"changed"}"#)?;

    for _ in 0..4 {
        ws.on_device("boot")?.assert().success();
    }

    let status = ws.status()?;
    assert_eq!(status["active"], "A");
    let settings: Value = serde_json::from_slice(&fs::read(ws.device.join("settings.json"))?)?;
    assert_eq!(settings["wifi.ssid"], "home");
    Ok(())
}

#[test]
fn test_wrong_hardware_is_reported() -> TestResult {
    let ws = Workspace::release(&image(4000), "ESP8266")?;
    let out = apply(&ws)?;
    assert_eq!(out.status.code(), Some(2));
    let result = json_output(&out.stdout)?;
    assert_eq!(result["result"]["status"], "Invalid");
    assert_eq!(result["result"]["error"], "HardwareMismatch");
    assert!(!ws.device.join("partition_b.bin").exists());
    assert!(ws.keys.join("release.key.json").exists());
    Ok(())
}

#[test]
fn test_low_supply_refuses_update() -> TestResult {
    let ws = Workspace::release(&image(4000), "ESP32")?;
    let out = ws
        .on_device("apply-local")?
        .args(["--supply-mv", "3000", "--media"])
        .arg(&ws.media)
        .output()?;
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(json_output(&out.stdout)?["result"]["error"], "InsufficientPower");
    assert!(!ws.device.join("vault/config_snapshot.json").exists());
    Ok(())
}
