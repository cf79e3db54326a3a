//! Picks the host's volume driver at runtime.

use crate::cryptsetup::CryptsetupDriver;
use crate::hdiutil::HdiutilDriver;
use capsule_core::config::CapsuleConfig;
use capsule_core::error::{CapsuleError, CapsuleResult};
use capsule_core::provider::{MountOutcome, PopulateFn, VolumeDriver};
use capsule_core::secret::Secret;
use std::env::consts::OS;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum SystemVolumeDriver {
    Hdiutil(HdiutilDriver),
    Cryptsetup(CryptsetupDriver),
}

impl SystemVolumeDriver {
    /// `hdiutil` on macOS, `cryptsetup` on Linux.
    pub fn detect(config: &CapsuleConfig) -> CapsuleResult<Self> {
        match OS {
            "macos" => Ok(Self::Hdiutil(HdiutilDriver::from_config(config)?)),
            "linux" => Ok(Self::Cryptsetup(CryptsetupDriver::from_config(config)?)),
            other => Err(CapsuleError::InvalidConfig(format!(
                "unsupported operating system: {other} (macOS and Linux are supported)"
            ))),
        }
    }

    /// Volume file name for this host, without looking up binaries.
    pub fn host_volume_file() -> &'static str {
        if OS == "macos" {
            crate::hdiutil::SPARSE_IMAGE_FILE
        } else {
            crate::cryptsetup::LUKS_IMAGE_FILE
        }
    }

    fn inner(&self) -> &dyn VolumeDriver {
        match self {
            Self::Hdiutil(driver) => driver,
            Self::Cryptsetup(driver) => driver,
        }
    }
}

impl VolumeDriver for SystemVolumeDriver {
    fn create(
        &self,
        path: &Path,
        capacity_gb: u32,
        secret: &Secret,
        on_ready: PopulateFn<'_>,
    ) -> CapsuleResult<()> {
        self.inner().create(path, capacity_gb, secret, on_ready)
    }

    fn open(&self, path: &Path, secret: &Secret) -> CapsuleResult<MountOutcome> {
        self.inner().open(path, secret)
    }

    fn close(&self, mount_point: &Path) -> CapsuleResult<()> {
        self.inner().close(mount_point)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner().exists(path)
    }

    fn find_mount_point(&self, path: &Path) -> CapsuleResult<Option<PathBuf>> {
        self.inner().find_mount_point(path)
    }

    fn volume_file_name(&self) -> &'static str {
        self.inner().volume_file_name()
    }
}
