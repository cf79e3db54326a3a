//! Lifecycle coordinator: bootstrap, unlock, start, stop and lock.
//!
//! Every decision re-queries the drivers. Mount state in particular is never
//! remembered between calls; the volume driver's bookkeeping is the only
//! source of truth.

use crate::config::CapsuleConfig;
use crate::detector::{EnvironmentState, StateDetector};
use crate::error::{CapsuleError, CapsuleResult};
use crate::guard::ShutdownGuard;
use crate::provider::{
    ContainerConfig, ContainerDriver, ContainerState, MountOutcome, VolumeDriver, VOLUME_TARGET,
    WORKSPACE_TARGET,
};
use crate::secret::{Secret, SecretPrompt};
use crate::workflow::{
    event, populate_volume, status_report, ProvisionPlan, WorkflowEvent, WorkflowLevel,
    WorkflowReport,
};
use crate::workspace::{Workspace, SHADOW_LINK_NAME};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;

const PASSWORD_PROMPT: &str = "Enter volume password: ";
const REMOUNT_PROMPT: &str = "Enter volume password to remount: ";

/// Shell exit statuses that count as a normal end of session.
const NORMAL_EXIT_CODES: &[i32] = &[0, 130];

/// Inputs for creating a new volume.
#[derive(Debug)]
pub struct BootstrapRequest {
    pub volume_path: PathBuf,
    pub size_gb: u32,
    pub plan: ProvisionPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Mounted,
    AlreadyMounted,
}

impl UnlockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnlockStatus::Mounted => "mounted",
            UnlockStatus::AlreadyMounted => "already_mounted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockReport {
    pub volume_path: PathBuf,
    pub mount_point: PathBuf,
    pub status: UnlockStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Locked,
    NotMounted,
}

impl LockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LockStatus::Locked => "locked",
            LockStatus::NotMounted => "not_mounted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockReport {
    pub volume_path: PathBuf,
    pub mount_point: Option<PathBuf>,
    pub status: LockStatus,
    pub container_stopped: bool,
}

/// Outcome of an interactive `start` session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub container_name: String,
    pub mount_point: PathBuf,
    pub exit_code: i32,
    pub report: WorkflowReport,
}

type Reporter = Box<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Drives the volume and container drivers through the workspace lifecycle.
pub struct LifecycleCoordinator<V, C> {
    config: Arc<CapsuleConfig>,
    volume: Arc<V>,
    container: Arc<C>,
    signal_handlers: bool,
    reporter: Option<Reporter>,
}

impl<V, C> LifecycleCoordinator<V, C>
where
    V: VolumeDriver + 'static,
    C: ContainerDriver + 'static,
{
    pub fn new(config: Arc<CapsuleConfig>, volume: Arc<V>, container: Arc<C>) -> Self {
        let signal_handlers = config.guard.enabled;
        Self {
            config,
            volume,
            container,
            signal_handlers,
            reporter: None,
        }
    }

    /// Whether the shutdown guard installs real signal handlers. Tests turn
    /// this off and drive the guard by hand.
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.signal_handlers = enabled;
        self
    }

    /// Receive every progress event as it happens.
    pub fn with_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn config(&self) -> &CapsuleConfig {
        &self.config
    }

    pub fn detector(&self) -> StateDetector<V, C> {
        StateDetector::new(
            Arc::clone(&self.volume),
            Arc::clone(&self.container),
            self.config.query_timeout(),
        )
    }

    fn note(&self, report: &mut WorkflowReport, level: WorkflowLevel, message: impl Into<String>) {
        let ev = event(level, message);
        match ev.level {
            WorkflowLevel::Warn | WorkflowLevel::Error => warn!("{}", ev.message),
            _ => info!("{}", ev.message),
        }
        if let Some(reporter) = &self.reporter {
            reporter(&ev);
        }
        report.events.push(ev);
    }

    /// Log a failed best-effort step without escalating it.
    fn best_effort(&self, report: &mut WorkflowReport, what: &str, result: CapsuleResult<()>) {
        if let Err(err) = result {
            self.note(report, WorkflowLevel::Warn, format!("{what} failed: {err}"));
        }
    }

    fn require_volume(&self, volume_path: &Path) -> CapsuleResult<()> {
        if !self.volume.exists(volume_path) {
            return Err(CapsuleError::NotFound(format!(
                "volume not found at {}",
                volume_path.display()
            )));
        }
        Ok(())
    }

    /// Create and populate a new volume. The secret is cleared on every path.
    pub fn bootstrap(
        &self,
        request: BootstrapRequest,
        secret: &mut Secret,
    ) -> CapsuleResult<WorkflowReport> {
        let result = self.bootstrap_inner(request, secret);
        secret.clear();
        result
    }

    fn bootstrap_inner(
        &self,
        request: BootstrapRequest,
        secret: &Secret,
    ) -> CapsuleResult<WorkflowReport> {
        let BootstrapRequest {
            volume_path,
            size_gb,
            plan,
        } = request;
        let mut report = WorkflowReport::new(format!("Bootstrap {}", volume_path.display()));

        self.config.check_capacity(size_gb)?;
        if !volume_path.is_absolute() {
            return Err(CapsuleError::InvalidConfig(format!(
                "volume path must be absolute: {}",
                volume_path.display()
            )));
        }
        secret.ensure_present()?;
        if self.volume.exists(&volume_path) {
            return Err(CapsuleError::AlreadyExists(volume_path));
        }
        if let Some(parent) = volume_path.parent() {
            fs::create_dir_all(parent)?;
        }

        self.note(
            &mut report,
            WorkflowLevel::Info,
            format!("Creating {size_gb} GB encrypted volume (this can take a while)"),
        );
        let mut populated = Vec::new();
        let mut populate = |mount_point: &Path| -> CapsuleResult<()> {
            populated = populate_volume(mount_point, &plan)?;
            Ok(())
        };
        let created = self
            .volume
            .create(&volume_path, size_gb, secret, &mut populate);

        if let Err(err) = created {
            if !matches!(err, CapsuleError::AlreadyExists(_)) && volume_path.exists() {
                if let Err(unlink) = fs::remove_file(&volume_path) {
                    warn!(
                        "failed to remove partial volume {}: {unlink}",
                        volume_path.display()
                    );
                }
            }
            return Err(err);
        }

        for ev in populated {
            self.note(&mut report, ev.level, ev.message);
        }
        self.note(
            &mut report,
            WorkflowLevel::Success,
            format!("Volume created at {}", volume_path.display()),
        );
        Ok(report)
    }

    /// Open the volume with `secret`, clearing it whatever the outcome.
    pub fn open_with_secret(
        &self,
        volume_path: &Path,
        secret: &mut Secret,
    ) -> CapsuleResult<MountOutcome> {
        let result = secret
            .ensure_present()
            .and_then(|()| self.volume.open(volume_path, secret));
        secret.clear();
        result
    }

    /// Mount the volume unless a live session already exists, in which case
    /// no secret is requested.
    pub fn unlock(
        &self,
        volume_path: &Path,
        prompt: &dyn SecretPrompt,
    ) -> CapsuleResult<UnlockReport> {
        self.require_volume(volume_path)?;
        if let Some(mount_point) = self.volume.find_mount_point(volume_path)? {
            info!("volume already mounted at {}", mount_point.display());
            return Ok(UnlockReport {
                volume_path: volume_path.to_path_buf(),
                mount_point,
                status: UnlockStatus::AlreadyMounted,
            });
        }

        let mut secret = prompt.read_secret(PASSWORD_PROMPT)?;
        let outcome = self.open_with_secret(volume_path, &mut secret)?;
        let status = if outcome.was_already_mounted() {
            UnlockStatus::AlreadyMounted
        } else {
            UnlockStatus::Mounted
        };
        Ok(UnlockReport {
            volume_path: volume_path.to_path_buf(),
            mount_point: outcome.mount_point().to_path_buf(),
            status,
        })
    }

    /// Check the runtime and build the image if it is missing or `force` is set.
    /// Returns whether a build happened.
    pub fn ensure_image(&self, force: bool) -> CapsuleResult<bool> {
        self.container.ping()?;
        let image = &self.config.container.image;
        if !force && self.container.image_exists(image)? {
            return Ok(false);
        }
        info!("building image {image}");
        self.container.build_image(image)?;
        Ok(true)
    }

    /// Guard whose cleanup locks this volume and stops this container.
    pub fn shutdown_guard(
        &self,
        volume_path: &Path,
        container_name: &str,
    ) -> CapsuleResult<ShutdownGuard> {
        let volume = Arc::clone(&self.volume);
        let container = Arc::clone(&self.container);
        let path = volume_path.to_path_buf();
        let name = container_name.to_string();
        let cleanup = move || {
            lock_volume(volume.as_ref(), container.as_ref(), &path, Some(&name)).map(|_| ())
        };
        if self.signal_handlers {
            ShutdownGuard::arm(cleanup)
        } else {
            Ok(ShutdownGuard::manual(cleanup))
        }
    }

    /// Mount, launch the workspace container and attach an interactive shell.
    ///
    /// On return the container is stopped but the volume stays mounted.
    pub fn start(
        &self,
        volume_path: &Path,
        workspace: &Workspace,
        prompt: &dyn SecretPrompt,
    ) -> CapsuleResult<SessionReport> {
        let name = workspace.container_name.as_str();
        let mut report = WorkflowReport::new(format!("Session {name}"));

        self.require_volume(volume_path)?;
        if self.ensure_image(false)? {
            self.note(
                &mut report,
                WorkflowLevel::Success,
                format!("Built image {}", self.config.container.image),
            );
        }

        if self.container.remove_if_present(name)? {
            self.note(&mut report, WorkflowLevel::Info, format!("Removed stale container {name}"));
            sleep(self.config.release_delay());
        }

        let mut mount_point = match self.volume.find_mount_point(volume_path)? {
            Some(existing) => {
                self.note(
                    &mut report,
                    WorkflowLevel::Info,
                    format!("Volume already mounted at {}", existing.display()),
                );
                existing
            }
            None => {
                let mut secret = prompt.read_secret(PASSWORD_PROMPT)?;
                let outcome = self.open_with_secret(volume_path, &mut secret)?;
                self.note(
                    &mut report,
                    WorkflowLevel::Security,
                    format!("Volume mounted at {}", outcome.mount_point().display()),
                );
                outcome.mount_point().to_path_buf()
            }
        };

        let guard = match self.shutdown_guard(volume_path, name) {
            Ok(guard) => guard,
            Err(err) => {
                self.best_effort(&mut report, "close volume", self.volume.close(&mount_point));
                return Err(err);
            }
        };

        self.best_effort(&mut report, "clear host cache", self.container.clear_host_cache());
        self.best_effort(
            &mut report,
            "refresh mount cache",
            self.container.refresh_cache_for(&mount_point),
        );

        let mut config = ContainerConfig {
            name: name.to_string(),
            image: self.config.container.image.clone(),
            volume_mount: mount_point.clone(),
            workspace_root: workspace.root.clone(),
        };

        if let Err(err) = self.container.start(&config) {
            if !err.is_retryable() {
                self.rollback(&mut report, name, &mount_point, guard);
                return Err(err);
            }
            self.note(
                &mut report,
                WorkflowLevel::Warn,
                format!("Mount cache conflict ({err}); remounting and retrying once"),
            );
            let released = guard.hold(|| {
                let removed = self.container.remove_if_present(name).map(|_| ());
                (removed, self.volume.close(&mount_point))
            });
            let Some((removed, closed)) = released else {
                return Err(interrupted());
            };
            self.best_effort(&mut report, "remove partial container", removed);
            self.best_effort(&mut report, "close volume", closed);
            sleep(self.config.settle_delay());

            let reopened = prompt
                .read_secret(REMOUNT_PROMPT)
                .and_then(|mut secret| self.open_with_secret(volume_path, &mut secret));
            match reopened {
                Ok(outcome) => mount_point = outcome.mount_point().to_path_buf(),
                Err(err) => {
                    self.rollback(&mut report, name, &mount_point, guard);
                    return Err(err);
                }
            }
            config.volume_mount = mount_point.clone();

            if let Err(err) = self.container.start(&config) {
                self.rollback(&mut report, name, &mount_point, guard);
                return Err(err);
            }
        }
        self.note(&mut report, WorkflowLevel::Success, format!("Container {name} started"));

        if let Err(err) = self
            .wait_until_running(name)
            .and_then(|()| self.link_shadow_docs(workspace))
        {
            self.rollback(&mut report, name, &mount_point, guard);
            return Err(err);
        }

        self.note(
            &mut report,
            WorkflowLevel::Info,
            "Entering container (type 'exit' to leave)",
        );
        guard.set_passthrough(true);
        let session = self
            .container
            .exec_interactive(name, &self.config.container.shell);
        guard.set_passthrough(false);

        match guard.complete_with(|| self.container.stop(name)) {
            Some(Ok(())) => self.note(&mut report, WorkflowLevel::Info, "Container stopped"),
            Some(Err(err)) => self.note(
                &mut report,
                WorkflowLevel::Warn,
                format!("Failed to stop container {name}: {err}"),
            ),
            None => return Err(interrupted()),
        }
        self.note(
            &mut report,
            WorkflowLevel::Security,
            "Volume remains unlocked for quick re-entry; run `capsule lock` when done",
        );

        let exit_code = session?;
        if !NORMAL_EXIT_CODES.contains(&exit_code) {
            return Err(CapsuleError::Driver(format!(
                "shell exited with status {exit_code}"
            )));
        }

        Ok(SessionReport {
            container_name: name.to_string(),
            mount_point,
            exit_code,
            report,
        })
    }

    /// Undo a partial start: remove the container and close the volume in
    /// place of the guard's cleanup. Failures are logged, never escalated.
    fn rollback(
        &self,
        report: &mut WorkflowReport,
        name: &str,
        mount_point: &Path,
        guard: ShutdownGuard,
    ) {
        self.note(report, WorkflowLevel::Warn, "Start failed; rolling back");
        let undone = guard.complete_with(|| {
            let removed = self.container.remove_if_present(name).map(|_| ());
            (removed, self.volume.close(mount_point))
        });
        match undone {
            Some((removed, closed)) => {
                self.best_effort(report, "remove container", removed);
                self.best_effort(report, "close volume", closed);
            }
            None => self.note(
                report,
                WorkflowLevel::Warn,
                "Shutdown cleanup already locked the volume",
            ),
        }
    }

    fn wait_until_running(&self, name: &str) -> CapsuleResult<()> {
        let attempts = self.config.retry.ready_attempts.max(1);
        let delay = self.config.ready_delay();
        for attempt in 1..=attempts {
            if self.container.is_running(name)? {
                return Ok(());
            }
            if attempt < attempts {
                sleep(delay);
            }
        }
        Err(CapsuleError::Timeout {
            what: format!("container {name} readiness"),
            after: delay * attempts,
        })
    }

    fn link_shadow_docs(&self, workspace: &Workspace) -> CapsuleResult<()> {
        let name = &workspace.container_name;
        let target = format!("{VOLUME_TARGET}/repos/{}", workspace.repo_id);
        let link = format!("{WORKSPACE_TARGET}/{SHADOW_LINK_NAME}");
        self.container.exec(name, &["mkdir", "-p", &target])?;
        self.container.exec(name, &["ln", "-sfn", &target, &link])?;
        Ok(())
    }

    /// Stop the workspace container. The volume is left alone.
    pub fn stop(&self, container_name: &str) -> CapsuleResult<ContainerState> {
        let prior = self.container.state(container_name)?;
        if prior != ContainerState::Absent {
            self.container.stop(container_name)?;
        }
        Ok(prior)
    }

    pub fn lock(
        &self,
        volume_path: &Path,
        container_name: Option<&str>,
    ) -> CapsuleResult<LockReport> {
        lock_volume(
            self.volume.as_ref(),
            self.container.as_ref(),
            volume_path,
            container_name,
        )
    }

    /// Snapshot plus the rendered status report.
    pub fn status(
        &self,
        volume_path: &Path,
        workspace: &Workspace,
    ) -> (EnvironmentState, WorkflowReport) {
        let detector = self.detector();
        let state = detector.detect(volume_path, &workspace.container_name, &workspace.root);
        let runtime = detector.runtime_health(&self.config.container.image);
        let report = status_report(&state, Some(&runtime));
        (state, report)
    }
}

fn interrupted() -> CapsuleError {
    CapsuleError::Driver("start interrupted by a shutdown signal".to_string())
}

/// Stop `container_name` if it is running, then close the mount point that
/// belongs to `volume_path`. Nothing happens when the volume is not mounted.
pub fn lock_volume<V, C>(
    volume: &V,
    container: &C,
    volume_path: &Path,
    container_name: Option<&str>,
) -> CapsuleResult<LockReport>
where
    V: VolumeDriver + ?Sized,
    C: ContainerDriver + ?Sized,
{
    let Some(mount_point) = volume.find_mount_point(volume_path)? else {
        info!("{} is not mounted; nothing to lock", volume_path.display());
        return Ok(LockReport {
            volume_path: volume_path.to_path_buf(),
            mount_point: None,
            status: LockStatus::NotMounted,
            container_stopped: false,
        });
    };

    let mut container_stopped = false;
    if let Some(name) = container_name {
        match container.is_running(name) {
            Ok(true) => match container.stop(name) {
                Ok(()) => container_stopped = true,
                Err(err) => warn!("failed to stop container {name}: {err}"),
            },
            Ok(false) => {}
            Err(err) => warn!("could not query container {name}: {err}"),
        }
    }

    info!("unmounting {}", mount_point.display());
    volume.close(&mount_point)?;
    Ok(LockReport {
        volume_path: volume_path.to_path_buf(),
        mount_point: Some(mount_point),
        status: LockStatus::Locked,
        container_stopped,
    })
}
