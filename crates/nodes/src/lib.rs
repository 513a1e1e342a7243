//! ContentWorks orchestration layer.
//!
//! This crate drives content items through their tier's stage plan and hands
//! finished deliverables to the destination platforms.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The executor and the publish coordinator sequence
//! calls between business logic in the [`pipeline`] crate and the port traits
//! (producers, publishers, state store, operator queue). They contain no
//! domain rules of their own: verdicts come from [`pipeline::score`],
//! termination decisions from [`pipeline::EscalationTracker`], and lifecycle
//! rules from [`pipeline::Item`].
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`executor`] | `PipelineExecutor`: submit, run, resume, close, cohort reset |
//! | [`publish`] | `PublishCoordinator`: idempotent multi-destination publish |
//! | [`spans`] | Tracing span constructors shared by both |

pub mod executor;
mod locks;
pub mod publish;
pub mod spans;

pub use executor::{Collaborators, PipelineExecutor, RunSummary};
pub use publish::{PublishCoordinator, PublishOutcome};

