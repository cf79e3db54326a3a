//! Turns `hdiutil`, `/proc/mounts` and `docker` CLI output into data the
//! drivers can reason about.

use capsule_core::error::{CapsuleError, CapsuleResult};
use regex::Regex;
use std::path::PathBuf;

const IMAGE_PATH_PATTERN: &str = r"^image-path\s*:\s*(.+?)\s*$";
const DEVICE_LINE_PATTERN: &str = r"^(/dev/\S+)\t[^\t]*(?:\t(.*))?$";

/// One disk image reported by `hdiutil info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttachedImage {
    pub image_path: PathBuf,
    pub mount_points: Vec<PathBuf>,
}

fn compile(pattern: &str) -> CapsuleResult<Regex> {
    Regex::new(pattern)
        .map_err(|err| CapsuleError::Driver(format!("invalid output pattern {pattern}: {err}")))
}

/// Split `hdiutil info` into per-image records. Images without a mounted
/// filesystem are kept with an empty `mount_points`.
pub(crate) fn parse_hdiutil_info(output: &str) -> CapsuleResult<Vec<AttachedImage>> {
    let image_re = compile(IMAGE_PATH_PATTERN)?;
    let device_re = compile(DEVICE_LINE_PATTERN)?;
    let mut images: Vec<AttachedImage> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = image_re.captures(line) {
            images.push(AttachedImage {
                image_path: PathBuf::from(&caps[1]),
                mount_points: Vec::new(),
            });
            continue;
        }
        if let (Some(current), Some(mount)) = (images.last_mut(), mount_column(&device_re, line)) {
            current.mount_points.push(mount);
        }
    }
    Ok(images)
}

/// Mount point reported by `hdiutil attach`. The last device line that
/// carries a filesystem path wins.
pub(crate) fn parse_attach_mount_point(output: &str) -> CapsuleResult<Option<PathBuf>> {
    let device_re = compile(DEVICE_LINE_PATTERN)?;
    Ok(output
        .lines()
        .filter_map(|line| mount_column(&device_re, line))
        .last())
}

fn mount_column(device_re: &Regex, line: &str) -> Option<PathBuf> {
    let caps = device_re.captures(line.trim_end_matches(['\r', '\n']))?;
    let mount = caps.get(2)?.as_str().trim();
    if mount.starts_with('/') {
        Some(PathBuf::from(mount))
    } else {
        None
    }
}

/// Find where `device` is mounted in a `/proc/mounts` style table.
pub(crate) fn mount_point_of(table: &str, device: &str) -> Option<PathBuf> {
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let target = fields.next()?;
        (unescape_mount_field(source) == device).then(|| PathBuf::from(unescape_mount_field(target)))
    })
}

/// The kernel escapes space, tab, newline and backslash as three-digit octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = field
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Runtime output that means its file-sharing layer still holds a stale view
/// of a mount source that was just closed and reopened.
pub(crate) fn is_cache_conflict(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("file exists") || lower.contains("operation not permitted")
}

pub(crate) fn is_hdiutil_auth_failure(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("authentication error") || lower.contains("authentication failed")
}

/// Docker reports a missing container, image or object.
pub(crate) fn is_docker_not_found(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such image")
        || lower.contains("is not running")
}
