#![cfg(unix)]

use capsule_core::config::CapsuleConfig;
use capsule_core::detector::{Check, StateDetector};
use capsule_core::link::LinkStatus;
use capsule_core::workflow::{status_report, WorkflowLevel};
use capsule_system::cryptsetup::LUKS_IMAGE_FILE;
use capsule_system::{CommandRunner, CryptsetupDriver, CryptsetupTools, DockerDriver};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn absent(tool: &str) -> CommandRunner {
    CommandRunner::locate(tool, None, &[], Duration::from_secs(5)).unwrap()
}

#[test]
fn status_survives_missing_host_tools() {
    let dir = tempdir().unwrap();
    let table = dir.path().join("mounts");
    let mapper = dir.path().join("mapper");
    fs::write(&table, "").unwrap();
    fs::create_dir(&mapper).unwrap();
    let project = dir.path().join("project");
    fs::create_dir(&project).unwrap();
    let volume = dir.path().join(LUKS_IMAGE_FILE);
    fs::write(&volume, b"").unwrap();

    let mut config = CapsuleConfig::default();
    config.volume.mount_root = dir.path().join("mnt").display().to_string();
    let tools = CryptsetupTools {
        cryptsetup: absent("capsule-test-no-cryptsetup"),
        mount: absent("capsule-test-no-mount"),
        umount: absent("capsule-test-no-umount"),
        mkfs: absent("capsule-test-no-mkfs"),
    };
    let volumes = Arc::new(
        CryptsetupDriver::with_tools(tools, &config).with_kernel_views(table, mapper),
    );
    let containers = Arc::new(DockerDriver::with_path(
        dir.path().join("no-docker"),
        &config,
    ));

    let detector = StateDetector::new(volumes, containers, Duration::from_secs(5));
    let state = detector.detect(&volume, "capsule-test", &project);
    let runtime = detector.runtime_health("capsule-test:latest");

    assert!(state.volume_exists);
    assert_eq!(state.mount, Check::Known(None));
    assert!(state.container.unknown_reason().is_some());
    assert_eq!(state.link, Check::Known(LinkStatus::Missing));
    assert!(runtime.reachable.unknown_reason().is_some());

    let report = status_report(&state, Some(&runtime));
    assert!(report
        .events
        .iter()
        .all(|event| event.level != WorkflowLevel::Error));
    assert!(report
        .events
        .iter()
        .any(|event| event.message.starts_with("Container:  Unknown")));
}

