//! Host-side view of the workspace shadow link.

use crate::provider::VOLUME_TARGET;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Health of the `_docs` link in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Missing,
    Active(PathBuf),
    Broken(PathBuf),
    /// Something other than a symlink occupies the link path.
    NotALink,
}

/// Inspect `link_path`.
///
/// The link is written from inside the container, so its target is usually a
/// container path under `/capsule`. When the volume is mounted on the host the
/// target is rebased onto `mount_point` before checking that it exists.
pub fn check_link(link_path: &Path, mount_point: Option<&Path>) -> io::Result<LinkStatus> {
    let meta = match fs::symlink_metadata(link_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LinkStatus::Missing),
        Err(err) => return Err(err),
    };
    if !meta.file_type().is_symlink() {
        return Ok(LinkStatus::NotALink);
    }

    let target = fs::read_link(link_path)?;
    let host_target = match (target.strip_prefix(VOLUME_TARGET), mount_point) {
        (Ok(rest), Some(mount)) => mount.join(rest),
        _ => target.clone(),
    };
    if host_target.exists() {
        Ok(LinkStatus::Active(target))
    } else {
        Ok(LinkStatus::Broken(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn missing_link() {
        let dir = tempdir().unwrap();
        let status = check_link(&dir.path().join("_docs"), None).unwrap();
        assert_eq!(status, LinkStatus::Missing);
    }

    #[test]
    fn regular_directory_is_not_a_link() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("_docs")).unwrap();
        let status = check_link(&dir.path().join("_docs"), None).unwrap();
        assert_eq!(status, LinkStatus::NotALink);
    }

    #[test]
    fn container_target_resolves_through_mount_point() {
        let ws = tempdir().unwrap();
        let mount = tempdir().unwrap();
        fs::create_dir_all(mount.path().join("repos/widget")).unwrap();
        let link = ws.path().join("_docs");
        symlink("/capsule/repos/widget", &link).unwrap();

        assert_eq!(
            check_link(&link, Some(mount.path())).unwrap(),
            LinkStatus::Active(PathBuf::from("/capsule/repos/widget"))
        );
        assert_eq!(
            check_link(&link, None).unwrap(),
            LinkStatus::Broken(PathBuf::from("/capsule/repos/widget"))
        );
    }
}
