//! Shared primitives for the credential pool gateway

mod cipher;
mod error;
mod secret;

pub use cipher::{Cipher, PlaintextCipher};
pub use error::{Error, Result};
pub use secret::Secret;
