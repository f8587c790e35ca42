//! Sandbox Session Manager library.
//!
//! Provides the core of a registry-gated sandbox execution service: the
//! registry-validated container launcher, the thread-safe session table,
//! the TTL-based inactivity reaper, and the lifecycle protocol that ties
//! them together. The HTTP framing lives in `api`; everything below it is
//! usable on its own against any [`engine::SandboxEngine`] implementation.

pub mod api;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod state;

#[cfg(test)]
pub mod testing;
