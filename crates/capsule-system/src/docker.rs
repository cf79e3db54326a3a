//! Container driver that shells out to the `docker` CLI.

use crate::command::{CommandRunner, Output};
use crate::parse::{is_cache_conflict, is_docker_not_found};
use capsule_core::config::CapsuleConfig;
use capsule_core::error::{CapsuleError, CapsuleResult};
use capsule_core::provider::{ContainerConfig, ContainerDriver, VOLUME_TARGET, WORKSPACE_TARGET};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

pub const DEFAULT_DOCKER_PATHS: &[&str] = &[
    "/usr/local/bin/docker",
    "/opt/homebrew/bin/docker",
    "/usr/bin/docker",
    "/Applications/Docker.app/Contents/Resources/bin/docker",
];

/// Image recipe built on demand by `build_image`.
pub const DOCKERFILE: &str = include_str!("../assets/Dockerfile");

#[derive(Debug, Clone)]
pub struct DockerDriver {
    runner: CommandRunner,
    build: CommandRunner,
    helper_image: String,
}

impl DockerDriver {
    pub fn from_config(config: &CapsuleConfig) -> CapsuleResult<Self> {
        let runner = CommandRunner::locate(
            "docker",
            config.container.runtime_path.as_deref(),
            DEFAULT_DOCKER_PATHS,
            config.command_timeout(),
        )?;
        Ok(Self::with_runner(runner, config))
    }

    pub fn with_path(path: PathBuf, config: &CapsuleConfig) -> Self {
        Self::with_runner(CommandRunner::new(path, config.command_timeout()), config)
    }

    fn with_runner(runner: CommandRunner, config: &CapsuleConfig) -> Self {
        Self {
            build: runner.with_timeout(config.create_timeout()),
            runner,
            helper_image: config.container.helper_image.clone(),
        }
    }

    fn run(&self, args: &[&str]) -> CapsuleResult<Output> {
        self.runner.run(args, None)
    }

    fn run_checked(&self, args: &[&str]) -> CapsuleResult<Output> {
        let out = self.run(args)?;
        if !out.success() {
            return Err(Self::classify_cli_error(self.runner.binary(), args, &out));
        }
        Ok(out)
    }

    fn classify_cli_error(binary: &Path, args: &[&str], output: &Output) -> CapsuleError {
        let diagnostic = output.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();

        if lower.contains("cannot connect to the docker daemon")
            || lower.contains("is the docker daemon running")
        {
            return CapsuleError::Driver(format!(
                "Docker is not running; start Docker Desktop or the docker service ({diagnostic})"
            ));
        }

        if args.first() == Some(&"run") && is_cache_conflict(diagnostic) {
            return CapsuleError::CacheConflict(diagnostic.to_string());
        }

        CapsuleError::Driver(format!(
            "{} {} exited with code {}: {}",
            binary.display(),
            args.join(" "),
            output.status,
            if diagnostic.is_empty() {
                "no additional output"
            } else {
                diagnostic
            }
        ))
    }

    fn remove(&self, name: &str) -> CapsuleResult<()> {
        let args = ["rm", "-f", name];
        let out = self.run(&args)?;
        if out.success() || is_docker_not_found(out.diagnostic()) {
            return Ok(());
        }
        if out.diagnostic().contains("already in progress") {
            debug!("removal of {name} already in progress");
            return Ok(());
        }
        Err(Self::classify_cli_error(self.runner.binary(), &args, &out))
    }
}

fn bind_mount(source: &Path, target: &str) -> String {
    format!(
        "type=bind,source={},target={target},consistency=delegated",
        source.display()
    )
}

impl ContainerDriver for DockerDriver {
    fn ping(&self) -> CapsuleResult<()> {
        let args = ["info", "--format", "{{.ServerVersion}}"];
        let out = self.run(&args)?;
        if out.success() {
            debug!("docker server {}", out.stdout.trim());
            return Ok(());
        }
        Err(CapsuleError::Driver(format!(
            "Docker is not running; start Docker Desktop or the docker service ({})",
            out.diagnostic()
        )))
    }

    fn image_exists(&self, image: &str) -> CapsuleResult<bool> {
        let args = ["image", "inspect", "--format", "{{.Id}}", image];
        let out = self.run(&args)?;
        if out.success() {
            return Ok(true);
        }
        if is_docker_not_found(out.diagnostic()) {
            return Ok(false);
        }
        Err(Self::classify_cli_error(self.runner.binary(), &args, &out))
    }

    fn build_image(&self, image: &str) -> CapsuleResult<()> {
        let args = ["build", "-t", image, "-"];
        info!("building {image} from embedded Dockerfile");
        let out = self.build.run(&args, Some(DOCKERFILE.as_bytes()))?;
        if !out.success() {
            return Err(Self::classify_cli_error(self.build.binary(), &args, &out));
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> CapsuleResult<bool> {
        let filter = format!("name=^{name}$");
        let out = self.run_checked(&["ps", "-a", "-q", "-f", filter.as_str()])?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn is_running(&self, name: &str) -> CapsuleResult<bool> {
        let args = ["inspect", "-f", "{{.State.Running}}", name];
        let out = self.run(&args)?;
        if out.success() {
            return Ok(out.stdout.trim() == "true");
        }
        if is_docker_not_found(out.diagnostic()) {
            return Ok(false);
        }
        Err(Self::classify_cli_error(self.runner.binary(), &args, &out))
    }

    fn start(&self, config: &ContainerConfig) -> CapsuleResult<()> {
        config.validate()?;
        let volume = bind_mount(&config.volume_mount, VOLUME_TARGET);
        let workspace = bind_mount(&config.workspace_root, WORKSPACE_TARGET);
        let home = format!("HOME={VOLUME_TARGET}/home");
        info!(
            "starting {} with volume {}",
            config.name,
            config.volume_mount.display()
        );
        self.run_checked(&[
            "run",
            "-d",
            "--name",
            config.name.as_str(),
            "--mount",
            volume.as_str(),
            "--mount",
            workspace.as_str(),
            "-w",
            WORKSPACE_TARGET,
            "-e",
            home.as_str(),
            "--entrypoint",
            "tail",
            config.image.as_str(),
            "-f",
            "/dev/null",
        ])?;
        Ok(())
    }

    fn stop(&self, name: &str) -> CapsuleResult<()> {
        if !self.exists(name)? {
            return Ok(());
        }
        if let Err(err) = self.run_checked(&["stop", name]) {
            warn!("docker stop {name} failed ({err}); killing");
            if let Err(kill) = self.run_checked(&["kill", name]) {
                if self.is_running(name)? {
                    return Err(CapsuleError::Driver(format!(
                        "failed to stop container {name}: stop error: {err}, kill error: {kill}"
                    )));
                }
            }
        }
        self.remove(name)
    }

    fn remove_if_present(&self, name: &str) -> CapsuleResult<bool> {
        if !self.exists(name)? {
            return Ok(false);
        }
        self.remove(name)?;
        Ok(true)
    }

    fn exec_interactive(&self, name: &str, shell: &str) -> CapsuleResult<i32> {
        self.runner.run_interactive(&["exec", "-it", name, shell])
    }

    fn exec(&self, name: &str, args: &[&str]) -> CapsuleResult<String> {
        let mut full = vec!["exec", name];
        full.extend_from_slice(args);
        Ok(self.run_checked(&full)?.stdout)
    }

    fn refresh_cache_for(&self, mount_point: &Path) -> CapsuleResult<()> {
        let volume = format!("{}:/refresh-check:ro", mount_point.display());
        self.run_checked(&[
            "run",
            "--rm",
            "-v",
            volume.as_str(),
            self.helper_image.as_str(),
            "ls",
            "/refresh-check",
        ])?;
        Ok(())
    }

    fn clear_host_cache(&self) -> CapsuleResult<()> {
        self.run_checked(&[
            "run",
            "--rm",
            "--privileged",
            "--pid=host",
            self.helper_image.as_str(),
            "sh",
            "-c",
            "sync; echo 3 > /proc/sys/vm/drop_caches",
        ])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> Output {
        Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status: 125,
        }
    }

    #[test]
    fn daemon_down_names_the_remedy() {
        let out = failed("Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?");
        let err = DockerDriver::classify_cli_error(Path::new("docker"), &["info"], &out);
        assert!(matches!(err, CapsuleError::Driver(_)));
        assert!(err.to_string().contains("start Docker"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn mount_conflict_on_run_is_retryable() {
        let out = failed("docker: Error response from daemon: error while creating mount source path '/tmp/capsule-abc': mkdir /tmp/capsule-abc: file exists.");
        let err = DockerDriver::classify_cli_error(Path::new("docker"), &["run", "-d"], &out);
        assert!(matches!(err, CapsuleError::CacheConflict(_)));

        let err = DockerDriver::classify_cli_error(Path::new("docker"), &["exec"], &out);
        assert!(matches!(err, CapsuleError::Driver(_)));
    }
}
