//! Spawns the host binaries (`hdiutil`, `cryptsetup`, `docker`, `git`) with
//! timeouts and captured output. Interactive sessions inherit the terminal.

use capsule_core::error::{CapsuleError, CapsuleResult};
use log::debug;
use std::env;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
/// Wraps a concrete binary path and the timeout applied to every call.
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
    /// Lookup failure, reported by every call instead of at construction.
    missing: Option<String>,
}

#[derive(Debug)]
/// Collects stdout, stderr, and exit status from a finished command.
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr when the tool wrote any, stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            missing: None,
        }
    }

    /// Runner for `tool` found through [`locate`]. A tool that is simply not
    /// installed yields a runner whose calls fail with the lookup error, so
    /// only the operations that need it degrade. A configured path that does
    /// not exist is still rejected up front.
    pub fn locate(
        tool: &str,
        configured: Option<&str>,
        candidates: &[&str],
        timeout: Duration,
    ) -> CapsuleResult<Self> {
        match locate(tool, configured, candidates) {
            Ok(path) => Ok(Self::new(path, timeout)),
            Err(CapsuleError::Driver(reason)) => {
                debug!("{reason}");
                Ok(Self {
                    path: PathBuf::from(tool),
                    timeout,
                    missing: Some(reason),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_available(&self) -> CapsuleResult<()> {
        match &self.missing {
            Some(reason) => Err(CapsuleError::Driver(reason.clone())),
            None => Ok(()),
        }
    }

    /// Same binary, different budget. Volume create/open and image builds
    /// run much longer than status queries.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            path: self.path.clone(),
            timeout,
            missing: self.missing.clone(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Execute the binary with arguments and an optional stdin payload.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> CapsuleResult<Output> {
        self.ensure_available()?;
        debug!("running {} {}", self.path.display(), args.join(" "));
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            CapsuleError::Driver(format!("failed to spawn {}: {err}", self.path.display()))
        })?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes)?;
                stdin.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, args, stdout_pipe, stderr_pipe)
    }

    /// Run with stdin, stdout and stderr attached to the caller's terminal and
    /// no timeout. Returns the child's exit code.
    pub fn run_interactive(&self, args: &[&str]) -> CapsuleResult<i32> {
        self.ensure_available()?;
        debug!("attaching {} {}", self.path.display(), args.join(" "));
        let status = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| {
                CapsuleError::Driver(format!("failed to spawn {}: {err}", self.path.display()))
            })?;
        Ok(exit_code(status))
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        args: &[&str],
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> CapsuleResult<Output> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CapsuleError::Timeout {
                what: format!("{} {}", self.path.display(), args.join(" ")),
                after: self.timeout,
            });
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| CapsuleError::Driver("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| CapsuleError::Driver("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_code(status),
        })
    }

    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<CapsuleResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> CapsuleResult<String> {
            if let Some(mut reader) = pipe {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(String::from_utf8_lossy(&buf).to_string())
            } else {
                Ok(String::new())
            }
        })
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Pick the binary for `tool`: the configured override if set, else the
/// first existing well-known location, else the first hit on `PATH`.
pub fn locate(tool: &str, configured: Option<&str>, candidates: &[&str]) -> CapsuleResult<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(CapsuleError::InvalidConfig(format!(
                "{tool} binary not found at {}",
                path.display()
            )));
        }
        return Ok(path);
    }

    if let Some(found) = candidates.iter().map(Path::new).find(|p| p.exists()) {
        return Ok(found.to_path_buf());
    }

    if let Some(search) = env::var_os("PATH") {
        if let Some(found) = env::split_paths(&search)
            .map(|dir| dir.join(tool))
            .find(|p| p.is_file())
        {
            return Ok(found);
        }
    }

    Err(CapsuleError::Driver(format!(
        "unable to locate {tool}; tried {candidates:?} and PATH"
    )))
}
