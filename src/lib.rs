//! Kiln - build-job dependency fetcher
//!
//! Resolves a build job's binary dependencies against an ordered
//! repository search path, backed by a content-addressed local cache with
//! a size budget, preinstall-image reuse, and deterministic dependency
//! manifests.

pub mod artifact;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod job;
pub mod meta;
pub mod repo;
pub mod resolve;
pub mod stats;

pub use error::{KilnError, KilnResult};
