//! Populates a freshly created volume with its fixed layout and initial
//! context. Runs exactly once, from the bootstrap `on_ready` callback.

use super::{event, WorkflowEvent, WorkflowLevel};
use crate::error::{CapsuleError, CapsuleResult};
use crate::provider::{VOLUME_TARGET, WORKSPACE_TARGET};
use crate::secret::Secret;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Top-level directories every volume carries. Never restructured after
/// bootstrap.
pub const VOLUME_LAYOUT: &[&str] = &["auth", "config", "context", "bootstrap", "repos", "home"];

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o600;
const CONTEXT_FILE: &str = "context/CONTEXT.md";
const VERSION_FILE: &str = "config/version";
const API_KEY_FILE: &str = "auth/api-key";

/// A markdown document appended to the initial context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDoc {
    pub title: String,
    pub body: String,
}

/// What to write into a new volume besides the directory layout.
#[derive(Debug, Default)]
pub struct ProvisionPlan {
    pub context: Vec<ContextDoc>,
    pub api_key: Option<Secret>,
    pub version: String,
}

/// Read `--context` files up front so a bad path fails before any volume
/// is created.
pub fn load_context_files(paths: &[PathBuf]) -> CapsuleResult<Vec<ContextDoc>> {
    paths
        .iter()
        .map(|path| {
            let body = fs::read_to_string(path).map_err(|err| {
                CapsuleError::InvalidConfig(format!(
                    "cannot read context file {}: {err}",
                    path.display()
                ))
            })?;
            let title = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(ContextDoc { title, body })
        })
        .collect()
}

/// Create the layout and seed files under `mount_point`.
pub fn populate_volume(
    mount_point: &Path,
    plan: &ProvisionPlan,
) -> CapsuleResult<Vec<WorkflowEvent>> {
    let mut events = Vec::new();

    for dir in VOLUME_LAYOUT {
        let path = mount_point.join(dir);
        fs::create_dir_all(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(DIR_MODE))?;
    }
    events.push(event(
        WorkflowLevel::Info,
        format!("Created volume layout: {}", VOLUME_LAYOUT.join(", ")),
    ));

    let context = render_context(&plan.context);
    write_private(&mount_point.join(CONTEXT_FILE), context.as_bytes())?;
    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Wrote initial context ({} extra document{})",
            plan.context.len(),
            if plan.context.len() == 1 { "" } else { "s" }
        ),
    ));

    write_private(
        &mount_point.join(VERSION_FILE),
        format!("{}\n", plan.version).as_bytes(),
    )?;

    if let Some(key) = &plan.api_key {
        write_private(&mount_point.join(API_KEY_FILE), key.expose())?;
        events.push(event(
            WorkflowLevel::Security,
            format!("Stored API key in {API_KEY_FILE} (mode 0600)"),
        ));
    }

    Ok(events)
}

fn write_private(path: &Path, contents: &[u8]) -> CapsuleResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.write_all(contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))?;
    Ok(())
}

fn render_context(docs: &[ContextDoc]) -> String {
    let mut out = format!(
        "# Capsule workspace\n\
         \n\
         This shell runs in an isolated container. Only two host paths are visible:\n\
         \n\
         - `{WORKSPACE_TARGET}` is the current project, mounted from the host.\n\
         - `{VOLUME_TARGET}` is the encrypted volume. `$HOME` lives in `{VOLUME_TARGET}/home`.\n\
         \n\
         Notes that should survive between sessions belong in `{WORKSPACE_TARGET}/_docs`,\n\
         which points at `{VOLUME_TARGET}/repos/<project>` inside the volume.\n"
    );
    for doc in docs {
        out.push_str(&format!("\n## {}\n\n{}\n", doc.title, doc.body.trim_end()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn populate_creates_layout_and_private_files() {
        let dir = tempdir().unwrap();
        let plan = ProvisionPlan {
            context: vec![ContextDoc {
                title: "team".into(),
                body: "Use rustfmt.\n".into(),
            }],
            api_key: Some(Secret::from_string("sk-test".into())),
            version: "0.3.0".into(),
        };

        let events = populate_volume(dir.path(), &plan).unwrap();
        for name in VOLUME_LAYOUT {
            assert!(dir.path().join(name).is_dir(), "{name} missing");
        }

        let context = fs::read_to_string(dir.path().join(CONTEXT_FILE)).unwrap();
        assert!(context.starts_with("# Capsule workspace"));
        assert!(context.contains("## team\n\nUse rustfmt."));

        let key_path = dir.path().join(API_KEY_FILE);
        assert_eq!(fs::read(&key_path).unwrap(), b"sk-test");
        let mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        assert_eq!(
            fs::read_to_string(dir.path().join(VERSION_FILE)).unwrap(),
            "0.3.0\n"
        );
        assert!(events.iter().any(|ev| ev.level == WorkflowLevel::Security));
    }

    #[test]
    fn populate_without_api_key_skips_auth_file() {
        let dir = tempdir().unwrap();
        populate_volume(dir.path(), &ProvisionPlan::default()).unwrap();
        assert!(dir.path().join("auth").is_dir());
        assert!(!dir.path().join(API_KEY_FILE).exists());
    }

    #[test]
    fn missing_context_file_is_invalid_config() {
        let dir = tempdir().unwrap();
        let err = load_context_files(&[dir.path().join("nope.md")]).unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidConfig(_)));
    }

    #[test]
    fn context_titles_come_from_file_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("architecture.md");
        fs::write(&path, "layers").unwrap();
        let docs = load_context_files(&[path]).unwrap();
        assert_eq!(docs[0].title, "architecture");
        assert_eq!(docs[0].body, "layers");
    }
}
