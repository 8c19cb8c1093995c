//! Credential profile pool with rate-limit rotation
//!
//! Manages the named credential profiles an agent backend can run under. Each
//! profile is a directory `<root>/instances/<sanitized-name>`; the pool points
//! the backend at the current one through a single environment variable and
//! moves to the next eligible profile when the provider rate-limits it.
//!
//! Account lifecycle:
//! 1. Names are discovered from the explicit list, the accounts file, or the
//!    fallback JSON file (first non-empty source wins)
//! 2. Names whose instance directory is missing are dropped with a warning
//! 3. The caller reports a rate limit → current account cools down, the pool
//!    scans once around the ring for an eligible account
//! 4. Cooldown expires → account is eligible again without explicit action

pub mod discovery;
pub mod error;
pub mod pool;

pub use discovery::{AccountSources, resolve_names, sanitize_name};
pub use error::{Error, Result};
pub use pool::{AccountPool, AccountSnapshot, PoolSettings};
