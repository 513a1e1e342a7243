//! Core orchestration domain for ContentWorks.
//!
//! This crate contains every domain concept of the content pipeline: newtype
//! identifiers, the item lifecycle, the stage registry, the scoring engine,
//! the escalation tracker, and the port traits that infrastructure crates
//! implement. Infrastructure crates never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`ItemId`, `StageId`, etc.) |
//! | [`types`] | Shared value types (`SafetyTier`, `AssetFingerprint`, `Timestamp`) |
//! | [`errors`] | Top-level error and retry-policy types |
//! | [`config`] | Raw TOML configuration and its validated form |
//! | [`registry`] | Per-tier stage plans |
//! | [`scoring`] | Rubrics and the pure `score` function |
//! | [`escalation`] | Consecutive-failure counters and termination signals |
//! | [`artifact`] | Stage producer output |
//! | [`item`] | The content item and its lifecycle state machine |
//! | [`ports`] | Traits for producers, publishers, storage and the operator queue |

pub mod artifact;
pub mod config;
pub mod errors;
pub mod escalation;
pub mod identifiers;
pub mod item;
pub mod ports;
pub mod registry;
pub mod scoring;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use artifact::{Artifact, AssetPayload};
pub use config::{LoadedConfig, PipelineConfig, PublishSettings};
pub use errors::{PipelineError, ProducerError, PublishError, RetryPolicy, StoreError};
pub use escalation::{
    EscalationKey, EscalationSignal, EscalationState, EscalationThresholds,
    EscalationTracker,
};
pub use identifiers::{
    AssetAddress, CohortKey, DestinationId, DimensionName, ItemId, RemotePostId, RubricName,
    RunId, StageId, TopicLabel,
};
pub use item::{
    BlockReason, Deliverable, Item, LifecycleState, StageOutcome, StageRecord, TerminationReason,
};
pub use ports::{
    AssetUpload, CommitOutcome, Directive, NoticeKind, OperatorNotice, OperatorQueue,
    PlatformPublisher, PostRequest, PublishRecord, StageContext, StageProducer, StateStore,
};
pub use registry::{StageKind, StagePlan, StageRegistry, StageSpec};
pub use scoring::{score, Criterion, DimensionScore, FailReason, Rubric, Verdict};
pub use types::{AssetFingerprint, AssetRef, SafetyTier, Timestamp};
