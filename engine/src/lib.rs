//! # PaySync Engine
//!
//! An offline-first, bidirectional sync engine for construction-contract
//! payment documents.
//!
//! The engine reconciles a locally mutable cache with an authoritative remote
//! store across unreliable connectivity. Users keep editing contracts, change
//! orders and payment requests offline; every edit marks its record dirty and
//! the next sync cycle pushes it, resolves server-assigned identities, and
//! pulls what other devices changed.
//!
//! ## Design Principles
//!
//! - **No IO**: all storage and network access sits behind [`LocalStore`] and [`RemoteStore`]
//! - **Data-driven**: per-table behaviour is declared once as an [`EntityDescriptor`]
//! - **Partial failure is normal**: a bad record is reported and retried next
//!   cycle; it never blocks the rest
//!
//! ## Core Concepts
//!
//! ### Identity
//!
//! Tables are either [`IdentityMode::LocalAuthoritative`] (the local id is the
//! remote primary key) or [`IdentityMode::RemoteAssigned`] (the server assigns
//! the key and rows are matched by business key). When a temporary local id is
//! replaced by an assigned one, every dependent foreign key is re-pointed
//! before the dependents are pushed.
//!
//! ### Cycle
//!
//! [`SyncOrchestrator::sync_all`] runs:
//!
//! 1. session check
//! 2. [`PushPipeline`] over tables in dependency order, repairing derived
//!    amounts with the [`ConsistencyCorrector`] first
//! 3. [`PullPipeline`] with per-table cursors and guarded reconciliation deletes
//! 4. cursor bookkeeping
//!
//! At most one cycle runs at a time.
//!
//! ## Quick Start
//!
//! ```rust
//! use paysync_engine::{
//!     domain, LocalStore, MemoryLocalStore, MemoryRemoteStore, Record, SyncConfig,
//!     SyncOrchestrator, SystemClock,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> paysync_engine::Result<()> {
//! let local = Arc::new(MemoryLocalStore::new());
//! let remote = Arc::new(MemoryRemoteStore::new(Arc::new(SystemClock)));
//! let config = SyncConfig::default();
//!
//! let orchestrator = SyncOrchestrator::new(
//!     local.clone(),
//!     remote.clone(),
//!     domain::contract_registry()?,
//!     config.clone(),
//! )?
//! .with_corrector(domain::contract_corrector(config.epsilon));
//!
//! local
//!     .put(Record::new_local(
//!         "C-1",
//!         "contracts",
//!         json!({"code": "C-1", "name": "North bridge"}),
//!         0,
//!     ))
//!     .await?;
//! local
//!     .put(Record::new_local(
//!         "tmp-1",
//!         "payment_requests",
//!         json!({"contractId": "C-1", "number": 1, "subtotal": 100.0, "tax": 16.0, "total": 120.0}),
//!         0,
//!     ))
//!     .await?;
//!
//! let result = orchestrator.sync_all().await;
//! assert!(result.success);
//! assert_eq!(result.repaired, 1);
//! assert_eq!(local.dirty_count("payment_requests").await?, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`MemoryLocalStore::export_snapshot`] and [`MemoryLocalStore::import_snapshot`]
//! move the whole cache through a versioned [`LocalSnapshot`] with
//! deterministic JSON ordering.

pub mod clock;
pub mod config;
pub mod corrector;
pub mod descriptor;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod pull;
pub mod push;
pub mod record;
pub mod remote;
pub mod result;
mod retry;
pub mod snapshot;
pub mod store;
pub mod tracker;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncConfig, DEFAULT_EPSILON};
pub use corrector::{ConsistencyCorrector, Correction, Invariant};
pub use descriptor::{Dependent, EntityDescriptor, FieldDef, FieldType, IdentityMode, Registry};
pub use error::{Error, Result};
pub use orchestrator::SyncOrchestrator;
pub use pull::PullPipeline;
pub use push::PushPipeline;
pub use record::{BusinessKey, IdMapping, Record, RemoteRow};
pub use remote::{MemoryRemoteStore, RemoteError, RemoteKey, RemoteResult, RemoteStore};
pub use result::{PullReport, PushReport, SyncResult, SyncStatus};
pub use snapshot::{LocalSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use store::{LocalStore, MemoryLocalStore};
pub use tracker::{DirtySet, DirtyTracker};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type Timestamp = u64;
