//! Point-in-time snapshot of volume, mount, container and link state.
//!
//! Every sub-check is bounded and independent: a check that errors or runs
//! past its deadline degrades to [`Check::Unknown`] without affecting the
//! others. Nothing here is cached; each call re-queries the live system.

use crate::link::{check_link, LinkStatus};
use crate::provider::{ContainerDriver, ContainerState, VolumeDriver};
use log::warn;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of one bounded sub-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    Known(T),
    Unknown(String),
}

impl<T> Check<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Check::Known(value) => Some(value),
            Check::Unknown(_) => None,
        }
    }

    pub fn unknown_reason(&self) -> Option<&str> {
        match self {
            Check::Known(_) => None,
            Check::Unknown(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentState {
    pub volume_path: PathBuf,
    pub volume_exists: bool,
    pub mount: Check<Option<PathBuf>>,
    pub container_name: String,
    pub container: Check<ContainerState>,
    pub link_path: PathBuf,
    pub link: Check<LinkStatus>,
}

impl EnvironmentState {
    /// Unknown mount state counts as not mounted.
    pub fn volume_mounted(&self) -> bool {
        self.mount_point().is_some()
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount.known().and_then(|mp| mp.as_deref())
    }

    pub fn container_exists(&self) -> bool {
        matches!(
            self.container.known(),
            Some(ContainerState::Stopped | ContainerState::Running)
        )
    }

    pub fn container_running(&self) -> bool {
        matches!(self.container.known(), Some(ContainerState::Running))
    }
}

/// Container runtime reachability and image presence, gathered alongside the
/// environment snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub reachable: Check<()>,
    pub image: String,
    pub image_present: Check<bool>,
}

pub struct StateDetector<V, C> {
    volume: Arc<V>,
    container: Arc<C>,
    timeout: Duration,
}

impl<V, C> StateDetector<V, C>
where
    V: VolumeDriver + 'static,
    C: ContainerDriver + 'static,
{
    pub fn new(volume: Arc<V>, container: Arc<C>, timeout: Duration) -> Self {
        Self {
            volume,
            container,
            timeout,
        }
    }

    pub fn detect(
        &self,
        volume_path: &Path,
        container_name: &str,
        workspace_root: &Path,
    ) -> EnvironmentState {
        let deadline = Instant::now() + self.timeout;

        let volume_exists = self.volume.exists(volume_path);

        let mount = {
            let driver = Arc::clone(&self.volume);
            let path = volume_path.to_path_buf();
            spawn_check("mount lookup", move || {
                driver.find_mount_point(&path).map_err(|err| err.to_string())
            })
        };
        let container = {
            let driver = Arc::clone(&self.container);
            let name = container_name.to_string();
            spawn_check("container lookup", move || {
                driver.state(&name).map_err(|err| err.to_string())
            })
        };

        let mount = mount.wait(deadline);
        let container = container.wait(deadline);

        let link_path = workspace_root.join(crate::workspace::SHADOW_LINK_NAME);
        let link = {
            let path = link_path.clone();
            let mount_point = mount.known().cloned().flatten();
            spawn_check("link check", move || {
                check_link(&path, mount_point.as_deref()).map_err(|err| err.to_string())
            })
        }
        .wait(Instant::now() + self.timeout);

        EnvironmentState {
            volume_path: volume_path.to_path_buf(),
            volume_exists,
            mount,
            container_name: container_name.to_string(),
            container,
            link_path,
            link,
        }
    }

    /// Check the runtime daemon and, when reachable, the workspace image.
    pub fn runtime_health(&self, image: &str) -> RuntimeHealth {
        let reachable = {
            let driver = Arc::clone(&self.container);
            spawn_check("runtime ping", move || driver.ping().map_err(|err| err.to_string()))
        }
        .wait(Instant::now() + self.timeout);

        let image_present = if reachable.known().is_some() {
            let driver = Arc::clone(&self.container);
            let name = image.to_string();
            spawn_check("image lookup", move || {
                driver.image_exists(&name).map_err(|err| err.to_string())
            })
            .wait(Instant::now() + self.timeout)
        } else {
            Check::Unknown("runtime unreachable".to_string())
        };

        RuntimeHealth {
            reachable,
            image: image.to_string(),
            image_present,
        }
    }
}

struct PendingCheck<T> {
    what: &'static str,
    rx: mpsc::Receiver<Result<T, String>>,
}

fn spawn_check<T, F>(what: &'static str, check: F) -> PendingCheck<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(check());
    });
    PendingCheck { what, rx }
}

impl<T> PendingCheck<T> {
    fn wait(self, deadline: Instant) -> Check<T> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(Ok(value)) => Check::Known(value),
            Ok(Err(reason)) => {
                warn!("{} failed: {}", self.what, reason);
                Check::Unknown(reason)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("{} did not finish before its deadline", self.what);
                Check::Unknown(format!("{} timed out", self.what))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Check::Unknown(format!("{} aborted", self.what))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CapsuleError, CapsuleResult};
    use crate::provider::{ContainerConfig, MountOutcome, PopulateFn};
    use crate::secret::Secret;
    use std::fs;
    use tempfile::tempdir;

    struct StubVolume {
        mounted: Option<PathBuf>,
        hang: bool,
    }

    impl VolumeDriver for StubVolume {
        fn create(&self, _: &Path, _: u32, _: &Secret, _: PopulateFn<'_>) -> CapsuleResult<()> {
            unreachable!()
        }
        fn open(&self, _: &Path, _: &Secret) -> CapsuleResult<MountOutcome> {
            unreachable!()
        }
        fn close(&self, _: &Path) -> CapsuleResult<()> {
            unreachable!()
        }
        fn find_mount_point(&self, _: &Path) -> CapsuleResult<Option<PathBuf>> {
            if self.hang {
                thread::sleep(Duration::from_secs(5));
            }
            Ok(self.mounted.clone())
        }
        fn volume_file_name(&self) -> &'static str {
            "capsule.img"
        }
    }

    struct StubContainer {
        fail: bool,
    }

    impl ContainerDriver for StubContainer {
        fn ping(&self) -> CapsuleResult<()> {
            Ok(())
        }
        fn image_exists(&self, _: &str) -> CapsuleResult<bool> {
            Ok(true)
        }
        fn build_image(&self, _: &str) -> CapsuleResult<()> {
            Ok(())
        }
        fn exists(&self, _: &str) -> CapsuleResult<bool> {
            if self.fail {
                return Err(CapsuleError::Driver("daemon not running".into()));
            }
            Ok(true)
        }
        fn is_running(&self, _: &str) -> CapsuleResult<bool> {
            Ok(false)
        }
        fn start(&self, _: &ContainerConfig) -> CapsuleResult<()> {
            unreachable!()
        }
        fn stop(&self, _: &str) -> CapsuleResult<()> {
            unreachable!()
        }
        fn remove_if_present(&self, _: &str) -> CapsuleResult<bool> {
            unreachable!()
        }
        fn exec_interactive(&self, _: &str, _: &str) -> CapsuleResult<i32> {
            unreachable!()
        }
        fn exec(&self, _: &str, _: &[&str]) -> CapsuleResult<String> {
            unreachable!()
        }
        fn refresh_cache_for(&self, _: &Path) -> CapsuleResult<()> {
            Ok(())
        }
        fn clear_host_cache(&self) -> CapsuleResult<()> {
            Ok(())
        }
    }

    #[test]
    fn snapshot_combines_all_checks() {
        let dir = tempdir().unwrap();
        let volume_path = dir.path().join("capsule.img");
        fs::write(&volume_path, b"").unwrap();
        let mount = dir.path().join("mnt");
        fs::create_dir(&mount).unwrap();

        let detector = StateDetector::new(
            Arc::new(StubVolume {
                mounted: Some(mount.clone()),
                hang: false,
            }),
            Arc::new(StubContainer { fail: false }),
            Duration::from_secs(2),
        );
        let state = detector.detect(&volume_path, "capsule-0000aaaa", dir.path());

        assert!(state.volume_exists);
        assert!(state.volume_mounted());
        assert_eq!(state.mount_point(), Some(mount.as_path()));
        assert!(state.container_exists());
        assert!(!state.container_running());
        assert_eq!(state.link, Check::Known(LinkStatus::Missing));
    }

    #[test]
    fn failing_check_degrades_only_its_field() {
        let dir = tempdir().unwrap();
        let detector = StateDetector::new(
            Arc::new(StubVolume {
                mounted: None,
                hang: false,
            }),
            Arc::new(StubContainer { fail: true }),
            Duration::from_secs(2),
        );
        let state = detector.detect(&dir.path().join("capsule.img"), "c", dir.path());

        assert!(!state.volume_exists);
        assert_eq!(state.mount, Check::Known(None));
        assert!(state
            .container
            .unknown_reason()
            .is_some_and(|r| r.contains("daemon not running")));
        assert!(!state.container_exists());
    }

    #[test]
    fn slow_check_times_out_without_blocking_others() {
        let dir = tempdir().unwrap();
        let detector = StateDetector::new(
            Arc::new(StubVolume {
                mounted: Some(dir.path().to_path_buf()),
                hang: true,
            }),
            Arc::new(StubContainer { fail: false }),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let state = detector.detect(&dir.path().join("capsule.img"), "c", dir.path());

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(state.mount.unknown_reason().is_some());
        assert!(!state.volume_mounted());
        assert!(state.container_exists());
    }
}
