//! HTTP client for the upstream kernel (authoritative content repository).
//!
//! This crate provides:
//! - [`KernelClient`]: change feed reader and snapshot/detail fetchers
//!
//! Retries and backoff are not handled here; a failed call fails the run and the
//! scheduler re-runs it later.

pub mod client;

pub use client::{KernelClient, USER_AGENT};
