//! ContentWorks persistence adapters.
//!
//! Implements [`pipeline::StateStore`] and [`pipeline::OperatorQueue`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** All filesystem access lives here. The orchestration
//! layer only sees the port traits.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`FileStateStore`] | One JSON document per key, atomic writes, content-addressed blobs |
//! | [`FileOperatorQueue`] | Append-only JSONL notice log |
//! | [`fakes`] | In-memory implementations for tests |

pub mod fakes;
mod fs;
mod queue;

pub use fs::FileStateStore;
pub use queue::FileOperatorQueue;
