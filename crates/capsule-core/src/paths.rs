//! Volume path resolution and deterministic mount points.

use crate::config::capsule_home;
use crate::error::{CapsuleError, CapsuleResult};
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

const VOLUMES_DIR: &str = "volumes";
const MOUNT_PREFIX: &str = "capsule-";
const MOUNT_HASH_LEN: usize = 12;

/// Where bootstrap should place a new volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeScope {
    Local,
    Global,
}

/// Resolves volume files in the order explicit, local, global.
#[derive(Debug, Clone)]
pub struct VolumeLocator {
    file_name: String,
    local_dir: PathBuf,
    global_dir: Option<PathBuf>,
}

impl VolumeLocator {
    pub fn new(
        file_name: impl Into<String>,
        local_dir: impl Into<PathBuf>,
        global_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            local_dir: local_dir.into(),
            global_dir,
        }
    }

    /// Locator rooted at the current directory and `~/.capsule/volumes`.
    pub fn from_env(file_name: impl Into<String>) -> CapsuleResult<Self> {
        let cwd = env::current_dir()?;
        let global = capsule_home().map(|home| home.join(VOLUMES_DIR));
        Ok(Self::new(file_name, cwd, global))
    }

    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.file_name)
    }

    pub fn global_path(&self) -> Option<PathBuf> {
        self.global_dir.as_ref().map(|dir| dir.join(&self.file_name))
    }

    /// Find an existing volume. Reports every searched location when none is found.
    pub fn resolve(&self, explicit: Option<&Path>) -> CapsuleResult<PathBuf> {
        if let Some(path) = explicit {
            let path = absolutize(path)?;
            if !path.is_file() {
                return Err(CapsuleError::NotFound(format!(
                    "volume not found at {}",
                    path.display()
                )));
            }
            return Ok(path);
        }

        let mut searched = Vec::new();
        let local = self.local_path();
        if local.is_file() {
            return Ok(normalize(&local));
        }
        searched.push(local);
        if let Some(global) = self.global_path() {
            if global.is_file() {
                return Ok(normalize(&global));
            }
            searched.push(global);
        }

        let listed = searched
            .iter()
            .map(|path| format!("  - {}", path.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(CapsuleError::NotFound(format!(
            "no volume found; looked in:\n{listed}\nrun `capsule bootstrap` first"
        )))
    }

    /// Target path for a new volume. Defaults to the global location.
    pub fn target(
        &self,
        explicit: Option<&Path>,
        scope: Option<VolumeScope>,
    ) -> CapsuleResult<PathBuf> {
        if let Some(path) = explicit {
            return absolutize(path);
        }
        match scope {
            Some(VolumeScope::Local) => Ok(normalize(&self.local_path())),
            Some(VolumeScope::Global) | None => self
                .global_path()
                .map(|path| normalize(&path))
                .ok_or_else(|| {
                    CapsuleError::InvalidConfig(
                        "HOME is not set; pass --volume or --local".to_string(),
                    )
                }),
        }
    }
}

/// Absolute, normalised form of `path`. Existing files resolve through
/// symlinks and `..`; a file that does not exist yet keeps its name under the
/// canonical parent.
pub fn absolutize(path: &Path) -> CapsuleResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };
    Ok(normalize(&absolute))
}

fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let lexical = lexical_normalize(path);
    if let (Some(parent), Some(name)) = (lexical.parent(), lexical.file_name()) {
        if let Ok(parent) = fs::canonicalize(parent) {
            return parent.join(name);
        }
    }
    lexical
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Mount point for `volume_path` under `mount_root`. Every spelling of the
/// same volume file maps to the same directory.
pub fn mount_point_for(mount_root: &Path, volume_path: &Path) -> PathBuf {
    let volume_path = normalize(volume_path);
    let digest = hex::encode(Sha256::digest(volume_path.to_string_lossy().as_bytes()));
    mount_root.join(format!("{MOUNT_PREFIX}{}", &digest[..MOUNT_HASH_LEN]))
}
