//! Passphrase handling shared by the coordinator and the CLI prompts.

use crate::error::{CapsuleError, CapsuleResult};
use std::fmt;
use zeroize::Zeroize;

/// Owned passphrase bytes that are wiped when no longer needed.
///
/// `clear()` overwrites the buffer in place and keeps its length so callers
/// (and tests) can observe that every byte was zeroed. Dropping the value
/// zeroizes and frees the buffer.
pub struct Secret {
    bytes: Vec<u8>,
}

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Take ownership of a string's bytes without leaving a plaintext copy.
    pub fn from_string(value: String) -> Self {
        Self::new(value.into_bytes())
    }

    /// Lend the bytes for one driver call.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }

    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|byte| *byte == 0)
    }

    /// Reject empty input before it reaches a driver.
    pub fn ensure_present(&self) -> CapsuleResult<()> {
        if self.bytes.is_empty() {
            return Err(CapsuleError::InvalidConfig(
                "password must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Constant-shape comparison used when confirming a new passphrase.
    pub fn matches(&self, other: &Secret) -> bool {
        if self.bytes.len() != other.bytes.len() {
            return false;
        }
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.bytes.len())
    }
}

/// Source of passphrases. The coordinator only calls it when a mount is
/// actually required.
pub trait SecretPrompt {
    fn read_secret(&self, prompt: &str) -> CapsuleResult<Secret>;

    /// Read a new passphrase twice and fail on mismatch.
    fn read_new_secret(&self, prompt: &str, confirm: &str) -> CapsuleResult<Secret> {
        let first = self.read_secret(prompt)?;
        let second = self.read_secret(confirm)?;
        if !first.matches(&second) {
            return Err(CapsuleError::InvalidConfig(
                "passwords do not match".to_string(),
            ));
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Scripted(RefCell<Vec<&'static str>>);

    impl SecretPrompt for Scripted {
        fn read_secret(&self, _prompt: &str) -> CapsuleResult<Secret> {
            let next = self.0.borrow_mut().remove(0);
            Ok(Secret::from_string(next.to_string()))
        }
    }

    #[test]
    fn clear_zeroes_in_place() {
        let mut secret = Secret::from_string("correct-secret".into());
        assert!(!secret.is_zeroed());
        secret.clear();
        assert_eq!(secret.len(), 14);
        assert!(secret.is_zeroed());
    }

    #[test]
    fn debug_hides_contents() {
        let secret = Secret::from_string("hunter2".into());
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn empty_secret_is_invalid() {
        let secret = Secret::new(Vec::new());
        assert!(matches!(
            secret.ensure_present(),
            Err(CapsuleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn new_secret_requires_matching_confirmation() {
        let prompt = Scripted(RefCell::new(vec!["abc", "abd"]));
        let err = prompt.read_new_secret("pw", "again").unwrap_err();
        assert!(err.to_string().contains("do not match"));

        let prompt = Scripted(RefCell::new(vec!["abc", "abc"]));
        let secret = prompt.read_new_secret("pw", "again").unwrap();
        assert_eq!(secret.expose(), b"abc");
    }
}
