//! Resolves a directory to its [`Workspace`] using `git` when available.

use crate::command::{locate, CommandRunner};
use capsule_core::error::CapsuleResult;
use capsule_core::paths::absolutize;
use capsule_core::workspace::Workspace;
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_GIT_PATHS: &[&str] = &["/usr/bin/git", "/usr/local/bin/git", "/opt/homebrew/bin/git"];

#[derive(Debug, Clone)]
pub struct GitResolver {
    runner: Option<CommandRunner>,
}

impl GitResolver {
    /// A resolver without `git` still works; every lookup falls back to the
    /// plain directory.
    pub fn discover(timeout: Duration) -> Self {
        let runner = match locate("git", None, DEFAULT_GIT_PATHS) {
            Ok(path) => Some(CommandRunner::new(path, timeout)),
            Err(err) => {
                debug!("git unavailable: {err}");
                None
            }
        };
        Self { runner }
    }

    pub fn with_path(path: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: Some(CommandRunner::new(path, timeout)),
        }
    }

    fn query(&self, dir: &Path, args: &[&str]) -> Option<String> {
        let runner = self.runner.as_ref()?;
        let dir = dir.to_string_lossy();
        let mut full = vec!["-C", dir.as_ref()];
        full.extend_from_slice(args);
        match runner.run(&full, None) {
            Ok(out) if out.success() => {
                let value = out.stdout.trim();
                (!value.is_empty()).then(|| value.to_string())
            }
            Ok(out) => {
                debug!("git {} failed: {}", args.join(" "), out.diagnostic());
                None
            }
            Err(err) => {
                debug!("git {} failed: {err}", args.join(" "));
                None
            }
        }
    }

    /// Top of the enclosing repository, or `dir` itself.
    pub fn workspace_root(&self, dir: &Path) -> CapsuleResult<PathBuf> {
        let dir = absolutize(dir)?;
        Ok(self
            .query(&dir, &["rev-parse", "--show-toplevel"])
            .map(PathBuf::from)
            .unwrap_or(dir))
    }

    pub fn remote_url(&self, root: &Path) -> Option<String> {
        self.query(root, &["remote", "get-url", "origin"])
    }

    pub fn resolve(&self, dir: &Path) -> CapsuleResult<Workspace> {
        let root = self.workspace_root(dir)?;
        let remote = self.remote_url(&root);
        Ok(Workspace::new(root, remote.as_deref()))
    }
}
