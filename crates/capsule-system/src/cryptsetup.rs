//! Linux volume driver: a sparse LUKS2 file opened through `cryptsetup`,
//! formatted ext4 and mounted under the mount root. Needs root.
//!
//! The device-mapper name is the mount point's directory name, so the kernel
//! mount table alone answers "where is this volume mounted".

use crate::command::{CommandRunner, Output};
use crate::parse::mount_point_of;
use capsule_core::config::CapsuleConfig;
use capsule_core::error::{CapsuleError, CapsuleResult};
use capsule_core::paths::mount_point_for;
use capsule_core::provider::{MountOutcome, PopulateFn, VolumeDriver};
use capsule_core::secret::Secret;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/sbin/cryptsetup",
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
];
pub const LUKS_IMAGE_FILE: &str = "capsule.img";
const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";
const MAPPER_DIR: &str = "/dev/mapper";
/// `cryptsetup` exit code for "no key available with this passphrase".
const EXIT_WRONG_PASSPHRASE: i32 = 2;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// The helper binaries the driver shells out to. Missing ones only fail the
/// operations that need them; `mkfs.ext4` matters to `create` alone.
#[derive(Debug, Clone)]
pub struct CryptsetupTools {
    pub cryptsetup: CommandRunner,
    pub mount: CommandRunner,
    pub umount: CommandRunner,
    pub mkfs: CommandRunner,
}

impl CryptsetupTools {
    pub fn discover(config: &CapsuleConfig) -> CapsuleResult<Self> {
        let query = config.query_timeout();
        Ok(Self {
            cryptsetup: CommandRunner::locate(
                "cryptsetup",
                config.volume.cryptsetup_path.as_deref(),
                DEFAULT_CRYPTSETUP_PATHS,
                query,
            )?,
            mount: CommandRunner::locate("mount", None, &["/bin/mount", "/usr/bin/mount"], query)?,
            umount: CommandRunner::locate("umount", None, &["/bin/umount", "/usr/bin/umount"], query)?,
            mkfs: CommandRunner::locate(
                "mkfs.ext4",
                None,
                &["/sbin/mkfs.ext4", "/usr/sbin/mkfs.ext4"],
                query,
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CryptsetupDriver {
    cryptsetup: CommandRunner,
    luks_format: CommandRunner,
    luks_open: CommandRunner,
    mount: CommandRunner,
    umount: CommandRunner,
    mkfs: CommandRunner,
    mount_root: PathBuf,
    mount_table: PathBuf,
    mapper_dir: PathBuf,
}

impl CryptsetupDriver {
    pub fn from_config(config: &CapsuleConfig) -> CapsuleResult<Self> {
        Ok(Self::with_tools(CryptsetupTools::discover(config)?, config))
    }

    pub fn with_tools(tools: CryptsetupTools, config: &CapsuleConfig) -> Self {
        let query = config.query_timeout();
        let cryptsetup = tools.cryptsetup.with_timeout(query);
        Self {
            luks_format: cryptsetup.with_timeout(config.create_timeout()),
            luks_open: cryptsetup.with_timeout(config.open_timeout()),
            cryptsetup,
            mount: tools.mount.with_timeout(config.open_timeout()),
            umount: tools.umount.with_timeout(query),
            mkfs: tools.mkfs.with_timeout(config.create_timeout()),
            mount_root: config.mount_root(),
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
            mapper_dir: PathBuf::from(MAPPER_DIR),
        }
    }

    /// Read mounts from `table` and mapped devices from `mapper_dir` instead
    /// of the live kernel views.
    pub fn with_kernel_views(mut self, table: PathBuf, mapper_dir: PathBuf) -> Self {
        self.mount_table = table;
        self.mapper_dir = mapper_dir;
        self
    }

    fn mapper_name(mount_point: &Path) -> CapsuleResult<String> {
        mount_point
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                CapsuleError::InvalidConfig(format!(
                    "mount point has no directory name: {}",
                    mount_point.display()
                ))
            })
    }

    fn device(&self, name: &str) -> PathBuf {
        self.mapper_dir.join(name)
    }

    fn mounted_at(&self, device: &Path) -> CapsuleResult<Option<PathBuf>> {
        let table = fs::read_to_string(&self.mount_table)?;
        Ok(mount_point_of(&table, &device.to_string_lossy()))
    }

    fn checked(&self, runner: &CommandRunner, args: &[&str], input: Option<&[u8]>) -> CapsuleResult<Output> {
        let out = runner.run(args, input)?;
        if out.success() {
            Ok(out)
        } else {
            Err(classify(runner, args, &out))
        }
    }

    fn map(&self, path: &Path, name: &str, secret: &Secret) -> CapsuleResult<()> {
        let image = path.to_string_lossy();
        let args = ["open", "--type", "luks", "--key-file", "-", image.as_ref(), name];
        self.checked(&self.luks_open, &args, Some(secret.expose()))
            .map(|_| ())
    }

    /// Check `secret` against the LUKS header without creating a mapping.
    fn verify(&self, path: &Path, secret: &Secret) -> CapsuleResult<()> {
        let image = path.to_string_lossy();
        let args = ["open", "--test-passphrase", "--key-file", "-", image.as_ref()];
        self.checked(&self.luks_open, &args, Some(secret.expose()))
            .map(|_| ())
    }

    fn unmap(&self, name: &str) -> CapsuleResult<()> {
        if !self.device(name).exists() {
            return Ok(());
        }
        let args = ["close", name];
        if let Err(err) = self.checked(&self.cryptsetup, &args, None) {
            warn!("cryptsetup close {name} failed ({err}); retrying deferred");
            self.checked(&self.cryptsetup, &["close", "--deferred", name], None)?;
        }
        Ok(())
    }

    fn attach(&self, device: &Path, mount_point: &Path) -> CapsuleResult<()> {
        let dev = device.to_string_lossy();
        let target = mount_point.to_string_lossy();
        self.checked(&self.mount, &[dev.as_ref(), target.as_ref()], None)
            .map(|_| ())
    }

    /// Undo a failed open: drop the mapping and the directory we created.
    fn abandon(&self, name: &str, mount_point: &Path, created_dir: bool) {
        if let Err(err) = self.unmap(name) {
            warn!("failed to close mapping {name}: {err}");
        }
        if created_dir {
            remove_mount_dir(mount_point);
        }
    }
}

fn classify(runner: &CommandRunner, args: &[&str], out: &Output) -> CapsuleError {
    let diagnostic = out.diagnostic();
    let is_open = args.first() == Some(&"open");
    if is_open
        && (out.status == EXIT_WRONG_PASSPHRASE
            || diagnostic.to_ascii_lowercase().contains("no key available"))
    {
        return CapsuleError::AuthFailure("wrong password for encrypted volume".to_string());
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

impl VolumeDriver for CryptsetupDriver {
    fn create(
        &self,
        path: &Path,
        capacity_gb: u32,
        secret: &Secret,
        on_ready: PopulateFn<'_>,
    ) -> CapsuleResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    CapsuleError::AlreadyExists(path.to_path_buf())
                }
                _ => CapsuleError::Io(err),
            })?;
        file.set_len(u64::from(capacity_gb) * BYTES_PER_GB)?;
        drop(file);

        let image = path.to_string_lossy();
        info!("formatting LUKS volume {}", path.display());
        self.checked(
            &self.luks_format,
            &[
                "luksFormat",
                "--batch-mode",
                "--type",
                "luks2",
                "--key-file",
                "-",
                image.as_ref(),
            ],
            Some(secret.expose()),
        )?;

        let mount_point = mount_point_for(&self.mount_root, path);
        let name = Self::mapper_name(&mount_point)?;
        self.map(path, &name, secret)?;
        let device = self.device(&name);
        let dev = device.to_string_lossy();
        if let Err(err) = self.checked(&self.mkfs, &["-q", "-L", "capsule", dev.as_ref()], None) {
            self.abandon(&name, &mount_point, false);
            return Err(err);
        }
        let created_dir = !mount_point.exists();
        fs::create_dir_all(&mount_point)?;
        if let Err(err) = self.attach(&device, &mount_point) {
            self.abandon(&name, &mount_point, created_dir);
            return Err(err);
        }

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
        let name = Self::mapper_name(&mount_point)?;
        let device = self.device(&name);
        if device.exists() {
            self.verify(path, secret)?;
            debug!("reusing existing mapping {name}");
        } else {
            self.map(path, &name, secret)?;
        }

        let created_dir = !mount_point.exists();
        fs::create_dir_all(&mount_point)?;
        if let Err(err) = self.attach(&device, &mount_point) {
            self.abandon(&name, &mount_point, created_dir);
            return Err(err);
        }
        info!("mounted {} at {}", path.display(), mount_point.display());
        Ok(MountOutcome::Mounted(mount_point))
    }

    fn close(&self, mount_point: &Path) -> CapsuleResult<()> {
        let name = Self::mapper_name(mount_point)?;
        let device = self.device(&name);

        if self.mounted_at(&device)?.is_some() {
            let target = mount_point.to_string_lossy();
            if let Err(err) = self.checked(&self.umount, &[target.as_ref()], None) {
                warn!("umount failed ({err}); detaching lazily");
                self.checked(&self.umount, &["-l", target.as_ref()], None)?;
            }
        } else {
            debug!("{} is not mounted", mount_point.display());
        }
        self.unmap(&name)?;
        remove_mount_dir(mount_point);
        Ok(())
    }

    fn find_mount_point(&self, path: &Path) -> CapsuleResult<Option<PathBuf>> {
        let expected = mount_point_for(&self.mount_root, path);
        let name = Self::mapper_name(&expected)?;
        self.mounted_at(&self.device(&name))
    }

    fn volume_file_name(&self) -> &'static str {
        LUKS_IMAGE_FILE
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        _dir: TempDir,
        driver: CryptsetupDriver,
        volume: PathBuf,
        table: PathBuf,
        mapper: PathBuf,
    }

    fn tool(dir: &Path, name: &str, body: &str) -> CommandRunner {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        CommandRunner::new(path, Duration::from_secs(5))
    }

    /// Fake tools that keep the mount table and mapper directory in files.
    fn rig() -> Rig {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mounts");
        let mapper = dir.path().join("mapper");
        let root = dir.path().join("mnt");
        fs::write(&table, "").unwrap();
        fs::create_dir(&mapper).unwrap();
        fs::create_dir(&root).unwrap();

        let m = mapper.display();
        let t = table.display();
        let tools = CryptsetupTools {
            cryptsetup: tool(
                dir.path(),
                "cryptsetup",
                &format!(
                    "for last; do :; done\n\
                     case \"$1\" in\n\
                       open) key=$(cat)\n\
                         [ \"$key\" = correct ] || {{ echo 'No key available with this passphrase.' >&2; exit 2; }}\n\
                         [ \"$2\" = --test-passphrase ] && exit 0\n\
                         touch \"{m}/$last\" ;;\n\
                       close) rm -f \"{m}/$last\" ;;\n\
                       luksFormat) cat >/dev/null ;;\n\
                       *) exit 1 ;;\n\
                     esac"
                ),
            ),
            mount: tool(dir.path(), "mount", &format!("echo \"$1 $2 ext4 rw 0 0\" >> {t}")),
            umount: tool(
                dir.path(),
                "umount",
                &format!("for last; do :; done\ngrep -v \" $last \" {t} > {t}.new\nmv {t}.new {t}"),
            ),
            mkfs: tool(dir.path(), "mkfs.ext4", "exit 0"),
        };

        let mut config = CapsuleConfig::default();
        config.volume.mount_root = root.display().to_string();
        let driver = CryptsetupDriver::with_tools(tools, &config)
            .with_kernel_views(table.clone(), mapper.clone());
        let volume = dir.path().join(LUKS_IMAGE_FILE);
        fs::write(&volume, b"").unwrap();
        Rig {
            _dir: dir,
            driver,
            volume,
            table,
            mapper,
        }
    }

    #[test]
    fn open_close_round_trip() {
        let rig = rig();
        let secret = Secret::from_string("correct".into());

        let outcome = rig.driver.open(&rig.volume, &secret).unwrap();
        let mount_point = outcome.mount_point().to_path_buf();
        assert!(!outcome.was_already_mounted());
        assert!(mount_point.is_dir());
        assert_eq!(
            rig.driver.find_mount_point(&rig.volume).unwrap(),
            Some(mount_point.clone())
        );

        let again = rig.driver.open(&rig.volume, &secret).unwrap();
        assert!(again.was_already_mounted());

        rig.driver.close(&mount_point).unwrap();
        assert_eq!(rig.driver.find_mount_point(&rig.volume).unwrap(), None);
        assert_eq!(fs::read_to_string(&rig.table).unwrap().trim(), "");
        assert_eq!(fs::read_dir(&rig.mapper).unwrap().count(), 0);
        assert!(!mount_point.exists());
    }

    #[test]
    fn wrong_password_is_auth_failure() {
        let rig = rig();
        let err = rig
            .driver
            .open(&rig.volume, &Secret::from_string("nope".into()))
            .unwrap_err();
        assert!(matches!(err, CapsuleError::AuthFailure(_)));
        assert_eq!(rig.driver.find_mount_point(&rig.volume).unwrap(), None);
        assert_eq!(fs::read_dir(&rig.mapper).unwrap().count(), 0);
    }

    #[test]
    fn create_refuses_existing_file() {
        let rig = rig();
        let err = rig
            .driver
            .create(
                &rig.volume,
                1,
                &Secret::from_string("correct".into()),
                &mut |_: &Path| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(err, CapsuleError::AlreadyExists(_)));
    }

    #[test]
    fn lingering_mapping_still_requires_the_password() {
        let rig = rig();
        let correct = Secret::from_string("correct".into());
        let mount_point = rig
            .driver
            .open(&rig.volume, &correct)
            .unwrap()
            .mount_point()
            .to_path_buf();
        // Unmounted behind our back; the device-mapper entry survives.
        fs::write(&rig.table, "").unwrap();

        let err = rig
            .driver
            .open(&rig.volume, &Secret::from_string("WRONG".into()))
            .unwrap_err();
        assert!(matches!(err, CapsuleError::AuthFailure(_)));
        assert_eq!(rig.driver.find_mount_point(&rig.volume).unwrap(), None);

        let outcome = rig.driver.open(&rig.volume, &correct).unwrap();
        assert_eq!(outcome.mount_point(), mount_point);
        assert!(!outcome.was_already_mounted());
    }

    #[test]
    fn any_spelling_of_the_volume_finds_its_mount() {
        let rig = rig();
        let parent = rig.volume.parent().unwrap();
        fs::create_dir(parent.join("sub")).unwrap();
        let dotted = parent.join("sub").join("..").join(LUKS_IMAGE_FILE);

        let outcome = rig
            .driver
            .open(&dotted, &Secret::from_string("correct".into()))
            .unwrap();
        assert_eq!(
            rig.driver.find_mount_point(&rig.volume).unwrap(),
            Some(outcome.mount_point().to_path_buf())
        );
        rig.driver.close(outcome.mount_point()).unwrap();
        assert_eq!(rig.driver.find_mount_point(&dotted).unwrap(), None);
    }
}
