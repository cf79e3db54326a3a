//! macOS volume driver backed by encrypted sparse images and `hdiutil`.

use crate::command::{CommandRunner, Output};
use crate::parse::{is_hdiutil_auth_failure, parse_attach_mount_point, parse_hdiutil_info};
use capsule_core::config::CapsuleConfig;
use capsule_core::error::{CapsuleError, CapsuleResult};
use capsule_core::paths::mount_point_for;
use capsule_core::provider::{MountOutcome, PopulateFn, VolumeDriver};
use capsule_core::secret::Secret;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_HDIUTIL_PATHS: &[&str] = &["/usr/bin/hdiutil"];
pub const SPARSE_IMAGE_FILE: &str = "capsule.sparseimage";
const VOLUME_NAME: &str = "Capsule";

#[derive(Debug, Clone)]
pub struct HdiutilDriver {
    query: CommandRunner,
    create: CommandRunner,
    open: CommandRunner,
    mount_root: PathBuf,
}

impl HdiutilDriver {
    pub fn from_config(config: &CapsuleConfig) -> CapsuleResult<Self> {
        let query = CommandRunner::locate(
            "hdiutil",
            config.volume.hdiutil_path.as_deref(),
            DEFAULT_HDIUTIL_PATHS,
            config.query_timeout(),
        )?;
        Ok(Self::with_runner(query, config))
    }

    pub fn with_path(path: PathBuf, config: &CapsuleConfig) -> Self {
        Self::with_runner(CommandRunner::new(path, config.query_timeout()), config)
    }

    fn with_runner(query: CommandRunner, config: &CapsuleConfig) -> Self {
        Self {
            create: query.with_timeout(config.create_timeout()),
            open: query.with_timeout(config.open_timeout()),
            query,
            mount_root: config.mount_root(),
        }
    }

    fn failure(&self, runner: &CommandRunner, args: &[&str], out: &Output) -> CapsuleError {
        let diagnostic = out.diagnostic();
        if is_hdiutil_auth_failure(diagnostic) {
            return CapsuleError::AuthFailure(
                "wrong password for encrypted volume".to_string(),
            );
        }
        CapsuleError::Driver(format!(
            "{} {} exited with code {}: {}",
            runner.binary().display(),
            args.join(" "),
            out.status,
            if diagnostic.is_empty() {
                "no additional output"
            } else {
                diagnostic
            }
        ))
    }

    fn attached_images(&self) -> CapsuleResult<Vec<crate::parse::AttachedImage>> {
        let args = ["info"];
        let out = self.query.run(&args, None)?;
        if !out.success() {
            return Err(self.failure(&self.query, &args, &out));
        }
        parse_hdiutil_info(&out.stdout)
    }

    fn is_attached(&self, mount_point: &Path) -> CapsuleResult<bool> {
        let wanted = canonical(mount_point);
        Ok(self.attached_images()?.iter().any(|image| {
            image
                .mount_points
                .iter()
                .any(|mp| mp == mount_point || canonical(mp) == wanted)
        }))
    }

    fn detach(&self, mount_point: &Path, force: bool) -> CapsuleResult<()> {
        let target = mount_point.to_string_lossy();
        let mut args = vec!["detach"];
        if force {
            args.push("-force");
        }
        args.push(target.as_ref());
        let out = self.query.run(&args, None)?;
        if out.success() {
            Ok(())
        } else {
            Err(self.failure(&self.query, &args, &out))
        }
    }
}

/// `/tmp` is a symlink on macOS and `hdiutil info` reports the resolved path.
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn remove_mount_dir(mount_point: &Path) {
    match fs::remove_dir(mount_point) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            "could not remove mount point {}: {err}",
            mount_point.display()
        ),
    }
}

impl VolumeDriver for HdiutilDriver {
    fn create(
        &self,
        path: &Path,
        capacity_gb: u32,
        secret: &Secret,
        on_ready: PopulateFn<'_>,
    ) -> CapsuleResult<()> {
        if self.exists(path) {
            return Err(CapsuleError::AlreadyExists(path.to_path_buf()));
        }
        let size = format!("{capacity_gb}g");
        let target = path.to_string_lossy();
        let args = [
            "create",
            "-size",
            size.as_str(),
            "-encryption",
            "AES-256",
            "-type",
            "SPARSE",
            "-fs",
            "APFS",
            "-volname",
            VOLUME_NAME,
            "-stdinpass",
            target.as_ref(),
        ];
        info!("creating sparse image {}", path.display());
        let out = self.create.run(&args, Some(secret.expose()))?;
        if !out.success() {
            return Err(self.failure(&self.create, &args, &out));
        }

        let mount_point = self.open(path, secret)?.mount_point().to_path_buf();
        let populated = on_ready(&mount_point);
        let closed = self.close(&mount_point);
        populated?;
        closed
    }

    fn open(&self, path: &Path, secret: &Secret) -> CapsuleResult<MountOutcome> {
        if !self.exists(path) {
            return Err(CapsuleError::NotFound(format!(
                "volume not found at {}",
                path.display()
            )));
        }
        if let Some(existing) = self.find_mount_point(path)? {
            return Ok(MountOutcome::AlreadyMounted(existing));
        }

        let mount_point = mount_point_for(&self.mount_root, path);
        let created_dir = !mount_point.exists();
        fs::create_dir_all(&mount_point)?;

        let mount_arg = mount_point.to_string_lossy();
        let image_arg = path.to_string_lossy();
        let args = [
            "attach",
            "-stdinpass",
            "-nobrowse",
            "-owners",
            "on",
            "-mountpoint",
            mount_arg.as_ref(),
            image_arg.as_ref(),
        ];
        let attached = self
            .open
            .run(&args, Some(secret.expose()))
            .and_then(|out| {
                if out.success() {
                    Ok(out)
                } else {
                    Err(self.failure(&self.open, &args, &out))
                }
            });
        let out = match attached {
            Ok(out) => out,
            Err(err) => {
                if created_dir {
                    remove_mount_dir(&mount_point);
                }
                return Err(err);
            }
        };

        match parse_attach_mount_point(&out.stdout)? {
            Some(reported) if canonical(&reported) != canonical(&mount_point) => {
                warn!(
                    "hdiutil reported mount point {} instead of {}",
                    reported.display(),
                    mount_point.display()
                );
            }
            _ => {}
        }
        info!("attached {} at {}", path.display(), mount_point.display());
        Ok(MountOutcome::Mounted(mount_point))
    }

    fn close(&self, mount_point: &Path) -> CapsuleResult<()> {
        if !self.is_attached(mount_point)? {
            debug!("{} is not attached; nothing to detach", mount_point.display());
            remove_mount_dir(mount_point);
            return Ok(());
        }

        if let Err(err) = self.detach(mount_point, false) {
            warn!("detach failed ({err}); forcing");
            if let Err(forced) = self.detach(mount_point, true) {
                if self.is_attached(mount_point)? {
                    return Err(forced);
                }
            }
        }
        remove_mount_dir(mount_point);
        Ok(())
    }

    fn find_mount_point(&self, path: &Path) -> CapsuleResult<Option<PathBuf>> {
        let wanted = canonical(path);
        Ok(self
            .attached_images()?
            .into_iter()
            .find(|image| image.image_path == path || canonical(&image.image_path) == wanted)
            .and_then(|image| image.mount_points.into_iter().next()))
    }

    fn volume_file_name(&self) -> &'static str {
        SPARSE_IMAGE_FILE
    }
}
