//! Workspace identity: repository id, container name and shadow link paths.
//!
//! Everything here is pure. Asking git for the root and remote lives in the
//! system crate; callers feed the results in.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const CONTAINER_PREFIX: &str = "capsule-";
pub const SHADOW_LINK_NAME: &str = "_docs";
pub const UNKNOWN_REPO: &str = "unknown-repo";
const MAX_REPO_ID_LEN: usize = 100;
const SHORT_ID_LEN: usize = 8;

/// A project directory plus its derived, stable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub repo_id: String,
    pub container_name: String,
}

impl Workspace {
    /// Build the identity from a resolved root and an optional `origin` URL.
    pub fn new(root: impl Into<PathBuf>, remote_url: Option<&str>) -> Self {
        let root = root.into();
        let repo_id = repo_id_for(&root, remote_url);
        let container_name = container_name_for(&repo_id);
        Self {
            root,
            repo_id,
            container_name,
        }
    }

    /// Host-side location of the shadow link inside the workspace.
    pub fn shadow_link(&self) -> PathBuf {
        self.root.join(SHADOW_LINK_NAME)
    }

    /// Per-project storage area inside a mounted volume.
    pub fn repo_dir(&self, mount_point: &Path) -> PathBuf {
        mount_point.join("repos").join(&self.repo_id)
    }
}

/// Derive the repository id from the remote URL, falling back to the
/// directory's base name.
pub fn repo_id_for(root: &Path, remote_url: Option<&str>) -> String {
    let raw = match remote_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => normalize_remote_url(url),
        None => root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    sanitize_repo_id(&raw)
}

/// Strip the protocol, rewrite scp-style `git@host:` and drop `.git`.
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim();
    for prefix in ["https://", "http://", "git://", "ssh://"] {
        if let Some(rest) = url.strip_prefix(prefix) {
            url = rest;
            break;
        }
    }
    let mut owned = match url.strip_prefix("git@") {
        Some(rest) => rest.replacen(':', "/", 1),
        None => url.to_string(),
    };
    if let Some(stripped) = owned.strip_suffix(".git") {
        owned = stripped.to_string();
    }
    owned
}

struct IdRules {
    separators: Regex,
    disallowed: Regex,
    hyphens: Regex,
}

fn id_rules() -> Option<&'static IdRules> {
    static RULES: OnceLock<Option<IdRules>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            Some(IdRules {
                separators: Regex::new(r"[/:\\@\s]+").ok()?,
                disallowed: Regex::new(r"[^a-zA-Z0-9._-]").ok()?,
                hyphens: Regex::new(r"-+").ok()?,
            })
        })
        .as_ref()
}

/// Reduce arbitrary input to a filesystem-safe id.
///
/// Separator runs become a single hyphen, other disallowed characters are
/// dropped, hyphen runs collapse and the result is trimmed and capped.
pub fn sanitize_repo_id(raw: &str) -> String {
    let Some(rules) = id_rules() else {
        return UNKNOWN_REPO.to_string();
    };
    let id = rules.separators.replace_all(raw, "-");
    let id = rules.disallowed.replace_all(&id, "");
    let id = rules.hyphens.replace_all(&id, "-");
    let mut id = id.trim_matches('-').to_string();
    if id.len() > MAX_REPO_ID_LEN {
        id.truncate(MAX_REPO_ID_LEN);
        id = id.trim_end_matches('-').to_string();
    }
    if id.is_empty() {
        UNKNOWN_REPO.to_string()
    } else {
        id
    }
}

/// First eight hex characters of sha256(repo id).
pub fn short_id(repo_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(repo_id.as_bytes()));
    digest[..SHORT_ID_LEN].to_string()
}

pub fn container_name_for(repo_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{}", short_id(repo_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn normalizes_common_remote_forms() {
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widget.git"),
            "github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("git@github.com:acme/widget.git"),
            "github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("git://example.org/tools"),
            "example.org/tools"
        );
    }

    #[test]
    fn https_and_ssh_remotes_share_an_id() {
        let root = Path::new("/home/dev/widget");
        let a = repo_id_for(root, Some("https://github.com/acme/widget.git"));
        let b = repo_id_for(root, Some("git@github.com:acme/widget.git"));
        assert_eq!(a, "github.com-acme-widget");
        assert_eq!(a, b);
    }

    #[test]
    fn falls_back_to_directory_name() {
        let id = repo_id_for(Path::new("/home/dev/My Project!"), None);
        assert_eq!(id, "My-Project");
        let id = repo_id_for(Path::new("/home/dev/widget"), Some("  "));
        assert_eq!(id, "widget");
    }

    #[test]
    fn sanitize_handles_degenerate_input() {
        assert_eq!(sanitize_repo_id("///"), UNKNOWN_REPO);
        assert_eq!(sanitize_repo_id("a//b::c"), "a-b-c");
        assert_eq!(sanitize_repo_id("a-/b"), "a-b");
        assert_eq!(sanitize_repo_id("dev@box\\C:\\src\tmy app"), "dev-box-C-src-my-app");
        assert_eq!(sanitize_repo_id("café #1"), "caf-1");
        let long = "x".repeat(99) + "-yyyy";
        let id = sanitize_repo_id(&long);
        assert_eq!(id.len(), 99);
        assert!(!id.ends_with('-'));
    }

    #[test]
    fn container_name_is_deterministic() {
        let a = Workspace::new("/src/widget", Some("git@github.com:acme/widget.git"));
        let b = Workspace::new("/src/widget", Some("git@github.com:acme/widget.git"));
        assert_eq!(a.container_name, b.container_name);
        assert!(a.container_name.starts_with(CONTAINER_PREFIX));
        assert_eq!(a.container_name.len(), CONTAINER_PREFIX.len() + 8);
    }

    #[test]
    fn container_names_do_not_collide_across_workspaces() {
        let names: HashSet<String> = (0..1000)
            .map(|i| Workspace::new(format!("/src/project-{i}"), None).container_name)
            .collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn shadow_link_and_repo_dir_paths() {
        let ws = Workspace::new("/src/widget", None);
        assert_eq!(ws.shadow_link(), PathBuf::from("/src/widget/_docs"));
        assert_eq!(
            ws.repo_dir(Path::new("/tmp/capsule-abc")),
            PathBuf::from("/tmp/capsule-abc/repos/widget")
        );
    }
}
