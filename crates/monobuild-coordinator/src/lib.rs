//! Build coordination.
//!
//! This crate contains:
//! - The Bazel builder (request admission, job dispatch, event handling)
//! - The job watcher feeding normalized scheduler events into the builder
//! - Lease-based leader election
//! - The periodic garbage collector
//! - The GitHub reporting seam

pub mod builder;
pub mod gc;
pub mod github;
pub mod leader;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::{BazelBuilder, BazelOptions, VaultConfig};
pub use gc::Gc;
pub use github::{CommitState, GithubReporter, StatusReporter};
pub use leader::{LeaderElection, LeaderEvent};
pub use watcher::JobWatcher;
