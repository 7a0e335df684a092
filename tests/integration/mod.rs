//! Integration test suite for hotupdater
//!
//! End-to-end tests that drive the update pipeline through the library API and the
//! `hotupdater` binary against throwaway installations in temporary directories.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! Tests are organized by functionality area:
//! - **pipeline**: Full update runs through the library, including bundles and rollback
//! - **catalog**: Backup naming, listing and manual restore
//! - **cli**: The `run` and `backups` commands as a user invokes them
//! - **helper_mode**: The helper entry point and its channel output

#[path = "../common/mod.rs"]
mod common;

mod catalog;
mod cli;
mod helper_mode;
mod pipeline;
