//! Password collection for the CLI: piped stdin, the `CAPSULE_PASSWORD`
//! environment variable, or an interactive no-echo prompt.

use capsule_core::error::{CapsuleError, CapsuleResult};
use capsule_core::secret::{Secret, SecretPrompt};
use log::info;
use rpassword::prompt_password;
use std::env;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};

pub const PASSWORD_ENV: &str = "CAPSULE_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Stdin,
    Env,
    Terminal,
}

#[derive(Debug)]
pub struct CliPrompt {
    source: SecretSource,
    stdin_consumed: AtomicBool,
}

impl CliPrompt {
    /// `--password-stdin` wins, then the environment, then the terminal.
    pub fn new(password_stdin: bool) -> Self {
        let source = if password_stdin {
            SecretSource::Stdin
        } else if env::var_os(PASSWORD_ENV).is_some() {
            SecretSource::Env
        } else {
            SecretSource::Terminal
        };
        Self {
            source,
            stdin_consumed: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> SecretSource {
        self.source
    }

    fn read_stdin(&self) -> CapsuleResult<Secret> {
        if self.stdin_consumed.swap(true, Ordering::SeqCst) {
            return Err(CapsuleError::InvalidConfig(
                "password was already read from stdin".to_string(),
            ));
        }
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Secret::from_string(line))
    }
}

impl SecretPrompt for CliPrompt {
    fn read_secret(&self, prompt: &str) -> CapsuleResult<Secret> {
        let secret = match self.source {
            SecretSource::Stdin => self.read_stdin()?,
            SecretSource::Env => {
                info!("using the volume password from {PASSWORD_ENV}");
                env::var(PASSWORD_ENV)
                    .map(Secret::from_string)
                    .map_err(|err| CapsuleError::InvalidConfig(format!("{PASSWORD_ENV}: {err}")))?
            }
            SecretSource::Terminal => Secret::from_string(prompt_password(prompt)?),
        };
        secret.ensure_present()?;
        Ok(secret)
    }
}

/// Hidden single-value prompt for non-password material such as API keys.
pub fn read_hidden(prompt: &str) -> CapsuleResult<Secret> {
    let secret = Secret::from_string(prompt_password(prompt)?);
    secret.ensure_present()?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_flag_takes_priority() {
        assert_eq!(CliPrompt::new(true).source(), SecretSource::Stdin);
    }

    #[test]
    fn stdin_is_read_only_once() {
        let prompt = CliPrompt::new(true);
        prompt.stdin_consumed.store(true, Ordering::SeqCst);
        let err = prompt.read_secret("pw").unwrap_err();
        assert!(err.to_string().contains("already read from stdin"));
    }
}
