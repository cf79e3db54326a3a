//! Capsule command-line interface: encrypted per-project workspaces backed by
//! an encrypted volume and a Docker container.

use anyhow::{bail, Context, Result};
use capsule_core::{
    logging,
    paths::absolutize,
    workflow::{load_context_files, ProvisionPlan},
    BootstrapRequest, CapsuleConfig, ContainerState, LifecycleCoordinator, SecretPrompt,
    VolumeLocator, VolumeScope, WorkflowEvent, WorkflowLevel, WorkflowReport, Workspace,
};
use capsule_system::{DockerDriver, GitResolver, SystemVolumeDriver};
use clap::{Parser, Subcommand};
use log::debug;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod prompt;

use prompt::CliPrompt;

type Coordinator = LifecycleCoordinator<SystemVolumeDriver, DockerDriver>;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "capsule",
    version,
    about = "Encrypted, containerised workspaces for per-project credentials and context."
)]
struct Cli {
    /// Path to the Capsule configuration file (defaults to ~/.capsule/config.toml).
    #[arg(short, long, global = true, env = "CAPSULE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering the workspace lifecycle.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and populate a new encrypted volume.
    Bootstrap {
        /// Capacity in GB; defaults to volume.default_size_gb.
        #[arg(long)]
        size: Option<u32>,

        /// Explicit volume file to create.
        #[arg(long, conflicts_with_all = ["local", "global"])]
        volume: Option<PathBuf>,

        /// Create the volume in the current directory.
        #[arg(long, conflicts_with = "global")]
        local: bool,

        /// Create the volume under ~/.capsule/volumes (the default).
        #[arg(long)]
        global: bool,

        /// Markdown files appended to the initial context document.
        #[arg(long = "context", value_name = "FILE")]
        context: Vec<PathBuf>,

        /// Prompt for an API key and store it inside the volume.
        #[arg(long)]
        api_key: bool,
    },

    /// Mount the volume, launch the container and attach a shell.
    Start {
        /// Volume file; defaults to the local, then the global location.
        #[arg(long)]
        volume: Option<PathBuf>,

        /// Project directory; defaults to the current directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Stop the workspace container and leave the volume mounted.
    Stop {
        /// Project directory; defaults to the current directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Mount the volume without starting a container.
    Unlock {
        /// Volume file; defaults to the local, then the global location.
        #[arg(long)]
        volume: Option<PathBuf>,

        /// Read the password from the first line of stdin.
        #[arg(long)]
        password_stdin: bool,
    },

    /// Stop the workspace container and unmount the volume.
    Lock {
        /// Volume file; defaults to the local, then the global location.
        #[arg(long)]
        volume: Option<PathBuf>,

        /// Project directory whose container is stopped first.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Report volume, container, link and runtime state.
    Status {
        /// Volume file; defaults to the local, then the global location.
        #[arg(long)]
        volume: Option<PathBuf>,

        /// Project directory; defaults to the current directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Build the workspace image from the embedded Dockerfile.
    BuildImage {
        /// Rebuild even when the image already exists.
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },

    /// Print the version.
    Version,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Dispatch to the requested subcommand.
fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Bootstrap {
            size,
            volume,
            local,
            global,
            context,
            api_key,
        } => {
            let coordinator = coordinator(config_path)?.with_reporter(report_event);
            let scope = if local {
                Some(VolumeScope::Local)
            } else if global {
                Some(VolumeScope::Global)
            } else {
                None
            };
            let volume_path = locator()?.target(volume.as_deref(), scope)?;
            let size_gb = size.unwrap_or(coordinator.config().volume.default_size_gb);
            coordinator.config().check_capacity(size_gb)?;
            if volume_path.exists() {
                bail!(
                    "a volume already exists at {}; remove it first or pick another --volume",
                    volume_path.display()
                );
            }

            let context = load_context_files(&context)?;
            let api_key = if api_key {
                Some(prompt::read_hidden("API key (input hidden): ")?)
            } else {
                None
            };
            let plan = ProvisionPlan {
                context,
                api_key,
                version: env!("CARGO_PKG_VERSION").to_string(),
            };

            let mut secret = CliPrompt::new(false)
                .read_new_secret("Enter new volume password: ", "Confirm volume password: ")?;
            let request = BootstrapRequest {
                volume_path,
                size_gb,
                plan,
            };
            let report = coordinator.bootstrap(request, &mut secret)?;
            eprintln!("{}: done. Run `capsule start` to enter the workspace.", report.title);
        }
        Commands::Start { volume, workspace } => {
            let coordinator = coordinator(config_path)?.with_reporter(report_event);
            let volume_path = locator()?.resolve(volume.as_deref())?;
            let workspace = resolve_workspace(coordinator.config(), workspace.as_deref())?;
            let session = coordinator.start(&volume_path, &workspace, &CliPrompt::new(false))?;
            eprintln!(
                "Session in {} ended; volume still mounted at {}",
                session.container_name,
                session.mount_point.display()
            );
        }
        Commands::Stop { workspace } => {
            let coordinator = coordinator(config_path)?;
            let workspace = resolve_workspace(coordinator.config(), workspace.as_deref())?;
            let prior = coordinator.stop(&workspace.container_name)?;
            match prior {
                ContainerState::Absent => {
                    eprintln!("No container {} to stop.", workspace.container_name)
                }
                _ => eprintln!("Container {} stopped.", workspace.container_name),
            }
        }
        Commands::Unlock {
            volume,
            password_stdin,
        } => {
            let coordinator = coordinator(config_path)?;
            let volume_path = locator()?.resolve(volume.as_deref())?;
            let prompt = CliPrompt::new(password_stdin);
            let report = coordinator.unlock(&volume_path, &prompt)?;
            print_kv("STATUS", report.status.as_str());
            print_kv("MOUNT_POINT", &report.mount_point.display().to_string());
            print_kv("VOLUME_PATH", &report.volume_path.display().to_string());
        }
        Commands::Lock { volume, workspace } => {
            let coordinator = coordinator(config_path)?;
            let volume_path = locator()?.resolve(volume.as_deref())?;
            let workspace = resolve_workspace(coordinator.config(), workspace.as_deref())?;
            let report = coordinator.lock(&volume_path, Some(&workspace.container_name))?;
            print_kv("STATUS", report.status.as_str());
            if let Some(mount_point) = &report.mount_point {
                print_kv("MOUNT_POINT", &mount_point.display().to_string());
            }
            print_kv("VOLUME_PATH", &report.volume_path.display().to_string());
            if report.container_stopped {
                eprintln!("Stopped container {}.", workspace.container_name);
            }
        }
        Commands::Status { volume, workspace } => {
            let report = status(config_path, volume.as_deref(), workspace.as_deref())
                .unwrap_or_else(|err| {
                    let mut report = WorkflowReport::new("Capsule status");
                    report.push(
                        WorkflowLevel::Error,
                        format!("Cannot inspect the environment: {err:#}"),
                    );
                    report
                });
            print_report(report);
        }
        Commands::BuildImage { force } => {
            let coordinator = coordinator(config_path)?;
            let image = coordinator.config().container.image.clone();
            if coordinator.ensure_image(force)? {
                println!("Built image {image}.");
            } else {
                println!("Image {image} already present; use --force to rebuild.");
            }
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(CapsuleConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let path = file.as_deref().or(config_path);
            let cfg = CapsuleConfig::discover(path).with_context(|| match path {
                Some(path) => format!("failed to load configuration from {}", path.display()),
                None => "failed to load configuration".to_string(),
            })?;

            let issues = cfg.validate();
            if issues.is_empty() {
                match &cfg.path {
                    Some(path) => println!("Configuration valid ({}).", path.display()),
                    None => println!("Configuration valid (built-in defaults)."),
                }
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
        Commands::Version => {
            println!("capsule {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Load configuration and wire the host drivers into a coordinator.
fn coordinator(config_path: Option<&Path>) -> Result<Coordinator> {
    let config = CapsuleConfig::discover(config_path).with_context(|| match config_path {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;
    let volume = SystemVolumeDriver::detect(&config)?;
    let container = DockerDriver::from_config(&config)?;
    Ok(LifecycleCoordinator::new(
        Arc::new(config),
        Arc::new(volume),
        Arc::new(container),
    ))
}

fn locator() -> Result<VolumeLocator> {
    Ok(VolumeLocator::from_env(
        SystemVolumeDriver::host_volume_file(),
    )?)
}

fn resolve_workspace(config: &CapsuleConfig, dir: Option<&Path>) -> Result<Workspace> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().context("cannot determine the current directory")?,
    };
    let resolver = GitResolver::discover(config.query_timeout());
    let workspace = resolver.resolve(&dir)?;
    debug!(
        "workspace {} (repo {}, container {})",
        workspace.root.display(),
        workspace.repo_id,
        workspace.container_name
    );
    Ok(workspace)
}

/// Status never fails the process; setup errors become part of the report.
fn status(
    config_path: Option<&Path>,
    volume: Option<&Path>,
    workspace: Option<&Path>,
) -> Result<WorkflowReport> {
    let coordinator = coordinator(config_path)?;
    let locator = locator()?;
    let volume_path = locator
        .resolve(volume)
        .unwrap_or_else(|_| status_fallback(&locator, volume));
    let workspace = resolve_workspace(coordinator.config(), workspace)?;
    let (_, report) = coordinator.status(&volume_path, &workspace);
    Ok(report)
}

/// A volume that does not exist yet is still reported on.
fn status_fallback(locator: &VolumeLocator, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return absolutize(path).unwrap_or_else(|_| path.to_path_buf());
    }
    locator
        .global_path()
        .unwrap_or_else(|| locator.local_path())
}

fn print_kv(key: &str, value: &str) {
    println!("{key}={value}");
}

/// Live progress for multi-step commands; stderr keeps stdout scriptable.
fn report_event(event: &WorkflowEvent) {
    eprintln!("  [{}] {}", level_tag(event.level), event.message);
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
