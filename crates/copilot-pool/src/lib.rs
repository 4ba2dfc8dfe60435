//! Credential pool for Copilot refresh credentials
//!
//! Manages an ordered, fixed-size set of refresh credentials with a shared
//! rotation index, per-credential access-token caching, and exponential
//! backoff for rate-limited credentials. State is process-lifetime only —
//! nothing is persisted.
//!
//! Credential lifecycle:
//! 1. Configuration provides the ordered credential list at startup
//! 2. `select()` picks the current credential, skipping backed-off slots
//! 3. `ensure_access_token()` returns the cached bearer or exchanges inline
//! 4. Upstream 429 → `mark_rate_limited()` starts/doubles the backoff and
//!    advances the shared index
//! 5. Backoff deadline passes → the credential becomes eligible again,
//!    cleared lazily on the next selection check (no timer)

pub mod backoff;
pub mod error;
pub mod pool;

pub use backoff::{Backoff, BackoffPolicy};
pub use error::{Error, Result};
pub use pool::{CredentialPool, CredentialStatus, CycleReport, PoolStatus, Selected};
