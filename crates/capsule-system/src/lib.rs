//! Host-backed drivers for Capsule: encrypted volumes through `hdiutil` or
//! `cryptsetup`, containers through the `docker` CLI, and workspace identity
//! through `git`. `command` and `parse` cover the shell integration details.

mod command;
mod parse;

pub mod cryptsetup;
pub mod docker;
pub mod git;
pub mod hdiutil;
mod volume;

pub use command::CommandRunner;
pub use cryptsetup::{CryptsetupDriver, CryptsetupTools};
pub use docker::DockerDriver;
pub use git::GitResolver;
pub use hdiutil::HdiutilDriver;
pub use volume::SystemVolumeDriver;
