//! Opaque sealing of stored secret material
//!
//! Credential rows hold refresh tokens, API keys and access tokens in sealed
//! form. The pool never inspects the sealed representation; it only calls
//! `seal` before writing and `open` right before use.

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Encrypt/decrypt hook for secrets at rest.
pub trait Cipher: Send + Sync {
    fn seal(&self, plain: &str) -> Result<String>;

    fn open(&self, sealed: &str) -> Result<Secret<String>>;
}

/// Identity cipher for deployments that keep the state file on an
/// encrypted volume instead of encrypting individual fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl Cipher for PlaintextCipher {
    fn seal(&self, plain: &str) -> Result<String> {
        Ok(plain.to_owned())
    }

    fn open(&self, sealed: &str) -> Result<Secret<String>> {
        if sealed.is_empty() {
            return Err(Error::Cipher("sealed value is empty".into()));
        }
        Ok(Secret::new(sealed.to_owned()))
    }
}
