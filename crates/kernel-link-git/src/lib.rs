//! Git project diffs for remote kernel script runs.
//!
//! Provides:
//! - `DiffProvider` - Compute the `FileSpec` a run request carries
//! - `normalize_remote_url` - SSH to HTTPS remote rewriting

pub mod diff;
pub mod remote;

pub use diff::{DiffError, DiffProvider};
pub use remote::normalize_remote_url;
