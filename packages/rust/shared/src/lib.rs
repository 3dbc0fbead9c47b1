//! Shared types, error model, and configuration for kernelsync.
//!
//! This crate is the foundation depended on by all other kernelsync crates.
//! It provides:
//! - [`SyncError`]: the unified error type
//! - Domain types ([`ChangeEvent`], [`ContainerSnapshot`], [`MemberDescriptor`], [`CatalogRecord`])
//! - Configuration ([`AppConfig`], [`SyncConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, InvalidOrderPolicy, KernelConfig, StorageConfig, SyncConfig, SyncPoliciesConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, SyncError};
pub use types::{
    ArticleRecord, CatalogRecord, ChangeEvent, ChangeTarget, ContainerSnapshot, DocumentFront,
    IssueRecord, JournalRecord, JournalSnapshot, MemberDescriptor, PdfLink, PipelineKind,
    RecordKind, RenditionData, RunId, SyncStage,
};
