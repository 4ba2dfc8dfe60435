//! GitHub Copilot token exchange library
//!
//! Exchanges a long-lived refresh credential for a short-lived Copilot
//! access token. This crate is a standalone library with no pool or proxy
//! awareness — it speaks to exactly one endpoint and reports exactly one
//! kind of failure.
//!
//! The device-flow bootstrap that produces refresh credentials in the first
//! place is an interactive one-time setup and lives outside this workspace.

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use token::{TokenResponse, fetch_access_token};
