//! Ephemeral GitHub Actions runner fleet on Hetzner Cloud
//!
//! This library provides the core functionality for the controller daemon.
//! The binary entry point is in main.rs.

pub mod bootstrap;
pub mod config;
pub mod fleet;
pub mod github;
pub mod provider;
pub mod provisioner;
pub mod runner_state;
pub mod server;
pub mod ssh;
pub mod webhook;

#[cfg(test)]
mod testing;
