//! # Tidemark Core
//!
//! Control plane for partitioned data-lake pipelines. Tracks which landed
//! files exist and in which version, routes them to the entity partitions they
//! cover, keeps a durable queue of partitions that must be rebuilt, and
//! publishes rebuilt partitions atomically with a commit record and lineage.
//!
//! All state lives in one embedded SQLite database owned by [`Storage`].

pub mod commit;
pub mod config;
pub mod contract;
pub mod dirty;
pub mod error;
pub mod export;
pub mod fingerprint;
pub mod lineage;
pub mod pipeline;
pub mod planner;
pub mod quality;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod scanner;
pub mod storage;
pub mod types;

// Re-export commonly used types at the crate root.
pub use commit::{
    ClearDirtyFlag, CommitHook, CommitInput, CommitLog, CommitMetadata, CommitRecord,
    HookContext, MarkInputsProcessed, PublishOutcome, PublishRequest, Publisher,
};
pub use config::{TidemarkConfig, config_exists, load_config};
pub use contract::{ColumnSpec, ColumnType, Contract};
pub use dirty::DirtyTracker;
pub use error::{
    ConfigError, ContractError, QualityGateFailure, ReconciliationError, RegistrationError,
    Result, RoutingError, StorageError, TidemarkError, TransformError,
};
pub use lineage::{LineageEmitter, LineageEvent, LineageLog, SqliteAuditEmitter};
pub use pipeline::{
    DiscoveryReport, JsonRecordsTransform, PartitionOutcome, PartitionStatus, Pipeline,
    TransformContext, TransformOutput, TransformStage,
};
pub use planner::{BuildPlan, PlanInput, Planner};
pub use quality::{ContractGate, GateChain, GateContext, QualityGate, QualityReport};
pub use reconcile::{ReconcileSummary, reconcile};
pub use registry::{RegistrationResult, Registry};
pub use router::{RouteRule, Router, RoutingOutcome, RuleSet, RuleSpec, expand};
pub use scanner::{ScanOptions, ScannedFile, scan_directory};
pub use storage::Storage;
pub use types::{
    DirtyPartition, DirtyStatus, FileRecord, FileStatus, Grain, PartitionLink, Row,
};
