//! Google OAuth token endpoint client
//!
//! Exchanges a stored refresh token plus an OAuth client id/secret pair for
//! a short-lived access token. The credential pool decides which client pair
//! to use and where to persist the result; this crate only speaks the
//! token endpoint protocol and classifies its failures.

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use token::{ClientPair, TokenResponse, refresh_access_token};
