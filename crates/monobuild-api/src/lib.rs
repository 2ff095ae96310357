//! HTTP ingress for the monobuild coordinator.
//!
//! Synchronous build API, GitHub webhook intake, health probes, and the
//! log proxy.

pub mod error;
pub mod process;
pub mod routes;
pub mod state;

pub use state::AppState;
