//! stackup
//!
//! Idempotent deployment of a compose-based web stack onto a single host:
//! dependencies, source trees, configuration, certificates, reverse proxy,
//! containers and health checks, each step skipped when the host already
//! satisfies it.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod infra;
pub mod installer;
pub mod logs;
pub mod storage;
pub mod utils;
