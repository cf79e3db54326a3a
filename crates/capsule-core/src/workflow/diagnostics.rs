//! Renders an [`EnvironmentState`] snapshot as the `status` report.

use super::{WorkflowLevel, WorkflowReport};
use crate::detector::{Check, EnvironmentState, RuntimeHealth};
use crate::link::LinkStatus;
use crate::provider::ContainerState;

/// Build the multi-line status view. Unknown checks become warning lines;
/// nothing here fails.
pub fn status_report(
    state: &EnvironmentState,
    runtime: Option<&RuntimeHealth>,
) -> WorkflowReport {
    let mut report = WorkflowReport::new("Capsule status");

    let exists = if state.volume_exists { "exists" } else { "not found" };
    report.push(
        WorkflowLevel::Info,
        format!("Volume:     {} ({exists})", state.volume_path.display()),
    );

    match &state.mount {
        Check::Known(Some(mount)) => report.push(
            WorkflowLevel::Security,
            format!("Mounted:    Yes ({})", mount.display()),
        ),
        Check::Known(None) => report.push(WorkflowLevel::Info, "Mounted:    No"),
        Check::Unknown(reason) => report.push(
            WorkflowLevel::Warn,
            format!("Mounted:    Unknown ({reason})"),
        ),
    }

    let name = &state.container_name;
    match &state.container {
        Check::Known(ContainerState::Running) => report.push(
            WorkflowLevel::Success,
            format!("Container:  Running ({name})"),
        ),
        Check::Known(ContainerState::Stopped) => {
            report.push(WorkflowLevel::Info, format!("Container:  Stopped ({name})"))
        }
        Check::Known(ContainerState::Absent) => report.push(
            WorkflowLevel::Info,
            format!("Container:  Not created ({name})"),
        ),
        Check::Unknown(reason) => report.push(
            WorkflowLevel::Warn,
            format!("Container:  Unknown ({reason})"),
        ),
    }

    let link = state.link_path.display();
    match &state.link {
        Check::Known(LinkStatus::Active(_)) => {
            report.push(WorkflowLevel::Info, format!("Symlink:    Active ({link})"))
        }
        Check::Known(LinkStatus::Broken(_)) => {
            report.push(WorkflowLevel::Info, format!("Symlink:    Broken ({link})"))
        }
        Check::Known(LinkStatus::Missing) => {
            report.push(WorkflowLevel::Info, "Symlink:    Not created")
        }
        Check::Known(LinkStatus::NotALink) => report.push(
            WorkflowLevel::Warn,
            format!("Symlink:    {link} exists but is not a symlink"),
        ),
        Check::Unknown(reason) => report.push(
            WorkflowLevel::Warn,
            format!("Symlink:    Unknown ({reason})"),
        ),
    }

    if let Some(runtime) = runtime {
        if let Check::Unknown(reason) = &runtime.reachable {
            report.push(
                WorkflowLevel::Warn,
                format!(
                    "Docker is not running ({reason}); start Docker before `capsule start`"
                ),
            );
        } else {
            match &runtime.image_present {
                Check::Known(true) => {}
                Check::Known(false) => report.push(
                    WorkflowLevel::Warn,
                    format!(
                        "Image {} not found; run `capsule build-image` or `capsule start`",
                        runtime.image
                    ),
                ),
                Check::Unknown(reason) => report.push(
                    WorkflowLevel::Warn,
                    format!("Could not inspect image {}: {reason}", runtime.image),
                ),
            }
        }
    }

    if state.volume_mounted() && !state.container_running() {
        report.push(
            WorkflowLevel::Security,
            "Volume is unlocked; run `capsule lock` when done.",
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn state(
        mount: Check<Option<PathBuf>>,
        container: Check<ContainerState>,
    ) -> EnvironmentState {
        EnvironmentState {
            volume_path: PathBuf::from("/home/dev/.capsule/volumes/capsule.img"),
            volume_exists: true,
            mount,
            container_name: "capsule-0badc0de".into(),
            container,
            link_path: PathBuf::from("/src/widget/_docs"),
            link: Check::Known(LinkStatus::Missing),
        }
    }

    fn lines(report: &WorkflowReport) -> Vec<&str> {
        report.events.iter().map(|ev| ev.message.as_str()).collect()
    }

    #[test]
    fn stopped_but_mounted_session() {
        let report = status_report(
            &state(
                Check::Known(Some(PathBuf::from("/tmp/capsule-abc"))),
                Check::Known(ContainerState::Absent),
            ),
            None,
        );
        let lines = lines(&report);
        assert!(lines.contains(&"Volume:     /home/dev/.capsule/volumes/capsule.img (exists)"));
        assert!(lines.contains(&"Mounted:    Yes (/tmp/capsule-abc)"));
        assert!(lines.contains(&"Container:  Not created (capsule-0badc0de)"));
        assert!(lines.contains(&"Symlink:    Not created"));
        assert!(lines.iter().any(|l| l.contains("capsule lock")));
    }

    #[test]
    fn unknown_checks_become_warnings() {
        let runtime = RuntimeHealth {
            reachable: Check::Unknown("connection refused".into()),
            image: "capsule:latest".into(),
            image_present: Check::Unknown("skipped".into()),
        };
        let report = status_report(
            &state(Check::Known(None), Check::Unknown("timed out".into())),
            Some(&runtime),
        );
        assert!(report.has_warnings());
        let lines = lines(&report);
        assert!(lines.contains(&"Mounted:    No"));
        assert!(lines.iter().any(|l| l.starts_with("Container:  Unknown")));
        assert!(lines.iter().any(|l| l.starts_with("Docker is not running")));
    }

    #[test]
    fn missing_image_is_reported() {
        let runtime = RuntimeHealth {
            reachable: Check::Known(()),
            image: "capsule:latest".into(),
            image_present: Check::Known(false),
        };
        let report = status_report(
            &state(Check::Known(None), Check::Known(ContainerState::Absent)),
            Some(&runtime),
        );
        assert!(lines(&report)
            .iter()
            .any(|l| l.contains("Image capsule:latest not found")));
    }
}
