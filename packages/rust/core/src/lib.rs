//! Incremental kernel → website sync engine.
//!
//! This crate ties the kernel client and the target store together:
//! - [`membership`] / [`resolver`]: container membership and member lookup
//! - [`drainer`]: change feed → membership merges
//! - [`records`] / [`registration`]: building and saving catalog records
//! - [`ledger`]: orphans carried between runs
//! - [`sync`]: end-to-end run orchestration (`run_sync`)

pub mod drainer;
pub mod ledger;
pub mod membership;
pub mod pipeline;
pub mod records;
pub mod registration;
pub mod resolver;
pub mod sync;

pub use drainer::{ChangeFeedDrainer, ChangeSet, DrainOutcome};
pub use ledger::OrphanLedger;
pub use membership::{MembershipIndex, Relation};
pub use pipeline::{ProgressReporter, SilentProgress};
pub use records::{RecordBuilder, RecordInput};
pub use registration::{RegistrationContext, RegistrationOutcome, RegistrationPipeline};
pub use resolver::{RelationResolver, Representation};
pub use sync::{StateSummary, SyncOutcome, SyncState, run_sync, summarize_state};
