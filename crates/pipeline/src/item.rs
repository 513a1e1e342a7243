//! The content item and its lifecycle state machine.
//!
//! ```text
//! PENDING ──► IN_PROGRESS ──► PUBLISHED   (terminal)
//!                 │   ▲
//!                 ▼   │ automatic retry / operator resume
//!               BLOCKED ─────► TERMINATED (terminal, operator close)
//!                 IN_PROGRESS ─► TERMINATED (escalation)
//! ```
//!
//! Every mutating method validates the transition and returns
//! [`PipelineError::InvalidTransition`] or [`PipelineError::NotInProgress`]
//! instead of mutating. Terminal items therefore can never change again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scoring::{FailReason, Verdict};
use crate::{
    AssetRef, DestinationId, EscalationSignal, ItemId, PipelineError, PublishError, SafetyTier,
    StageId, Timestamp, TopicLabel,
};

/// Lifecycle state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Pending,
    InProgress,
    Blocked,
    Published,
    Terminated,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Terminated)
    }

    fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Blocked)
                | (InProgress, Published)
                | (InProgress, Terminated)
                | (Blocked, InProgress)
                | (Blocked, Terminated)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Blocked => "BLOCKED",
            Self::Published => "PUBLISHED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    Pass,
    Fail,
}

/// One entry of an item's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub outcome: StageOutcome,
    /// 1-based attempt number of this stage for this item.
    pub attempt: u32,
    pub at: Timestamp,
    /// Score breakdown, present for review stages that produced an artifact.
    pub verdict: Option<Verdict>,
    pub fail_reasons: Vec<FailReason>,
    /// Free text the producer attached to its artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Why an item is waiting in BLOCKED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// A mandatory stage failed below the escalation threshold.
    StageFailed {
        stage: StageId,
        fail_reasons: Vec<FailReason>,
    },
    /// At least one destination failed; a human decides since assets exist.
    PublishFailed {
        failures: BTreeMap<DestinationId, PublishError>,
        /// Every failure was a rate limit, so a later resume may succeed as-is.
        retryable: bool,
    },
    /// An operator cancelled the run while `stage` (or publish, if `None`) was in flight.
    Cancelled { stage: Option<StageId> },
}

/// Why an item was terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Escalation { signal: EscalationSignal },
    OperatorClosed { reason: String },
}

/// Caption and assets that will be published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub caption: Option<String>,
    pub assets: Vec<AssetRef>,
}

/// One content unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    id: ItemId,
    topic: TopicLabel,
    tier: SafetyTier,
    state: LifecycleState,
    /// Index into the tier's stage plan of the next stage to run.
    cursor: usize,
    /// Plan index the item started at; earlier stages were bypassed by a directive.
    start_index: usize,
    history: Vec<StageRecord>,
    block_reason: Option<BlockReason>,
    termination: Option<TerminationReason>,
    needs_human_review: bool,
    /// The single automatic retry for the current stage has been used.
    retry_spent: bool,
    deliverable: Deliverable,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl Item {
    /// Creates a PENDING item that will start at plan index `start_index`.
    pub fn new(topic: TopicLabel, tier: SafetyTier, start_index: usize) -> Self {
        let now = Timestamp::now();
        Self {
            id: ItemId::new_random(),
            topic,
            tier,
            state: LifecycleState::Pending,
            cursor: start_index,
            start_index,
            history: Vec::new(),
            block_reason: None,
            termination: None,
            needs_human_review: false,
            retry_spent: false,
            deliverable: Deliverable::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn topic(&self) -> &TopicLabel {
        &self.topic
    }

    pub fn tier(&self) -> SafetyTier {
        self.tier
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    pub fn block_reason(&self) -> Option<&BlockReason> {
        self.block_reason.as_ref()
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    pub fn needs_human_review(&self) -> bool {
        self.needs_human_review
    }

    pub fn retry_spent(&self) -> bool {
        self.retry_spent
    }

    pub fn deliverable(&self) -> &Deliverable {
        &self.deliverable
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Number of attempts already recorded for `stage`.
    pub fn attempts(&self, stage: &StageId) -> u32 {
        let n = self.history.iter().filter(|r| &r.stage == stage).count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Whether the most recent record for `stage` is a PASS.
    pub fn has_passed(&self, stage: &StageId) -> bool {
        self.history
            .iter()
            .rev()
            .find(|r| &r.stage == stage)
            .is_some_and(|r| r.outcome == StageOutcome::Pass)
    }

    // -----------------------------------------------------------------------
    // Lifecycle transitions
    // -----------------------------------------------------------------------

    fn transition(&mut self, to: LifecycleState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                item: self.id,
                from: self.state,
                to,
            });
        }
        debug!(item = %self.id, from = %self.state, to = %to, "item transition");
        self.state = to;
        self.updated_at = Timestamp::now();
        Ok(())
    }

    fn ensure_in_progress(&self) -> Result<(), PipelineError> {
        if self.state == LifecycleState::InProgress {
            Ok(())
        } else {
            Err(PipelineError::NotInProgress {
                item: self.id,
                state: self.state,
            })
        }
    }

    /// PENDING → IN_PROGRESS.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.transition(LifecycleState::InProgress)
    }

    /// IN_PROGRESS → BLOCKED.
    pub fn block(&mut self, reason: BlockReason) -> Result<(), PipelineError> {
        self.transition(LifecycleState::Blocked)?;
        self.block_reason = Some(reason);
        Ok(())
    }

    /// Whether a BLOCKED item may take its one automatic retry.
    pub fn automatic_retry_available(&self) -> bool {
        self.state == LifecycleState::Blocked
            && !self.retry_spent
            && matches!(self.block_reason, Some(BlockReason::StageFailed { .. }))
    }

    /// BLOCKED → IN_PROGRESS, consuming the automatic retry for the current stage.
    pub fn begin_automatic_retry(&mut self) -> Result<(), PipelineError> {
        if !self.automatic_retry_available() {
            return Err(PipelineError::InvalidTransition {
                item: self.id,
                from: self.state,
                to: LifecycleState::InProgress,
            });
        }
        self.transition(LifecycleState::InProgress)?;
        self.retry_spent = true;
        self.block_reason = None;
        Ok(())
    }

    /// BLOCKED → IN_PROGRESS on operator request, with a fresh automatic retry.
    pub fn resume(&mut self) -> Result<(), PipelineError> {
        self.transition(LifecycleState::InProgress)?;
        self.retry_spent = false;
        self.block_reason = None;
        Ok(())
    }

    /// IN_PROGRESS/BLOCKED → TERMINATED. Always flags the item for human review.
    pub fn terminate(&mut self, reason: TerminationReason) -> Result<(), PipelineError> {
        self.transition(LifecycleState::Terminated)?;
        self.termination = Some(reason);
        self.needs_human_review = true;
        Ok(())
    }

    /// IN_PROGRESS → PUBLISHED.
    pub fn mark_published(&mut self) -> Result<(), PipelineError> {
        self.transition(LifecycleState::Published)?;
        self.block_reason = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage bookkeeping (IN_PROGRESS only)
    // -----------------------------------------------------------------------

    /// Appends a history entry.
    pub fn record_stage(&mut self, record: StageRecord) -> Result<(), PipelineError> {
        self.ensure_in_progress()?;
        self.history.push(record);
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Moves the cursor to `next` and re-arms the automatic retry.
    pub fn advance_to(&mut self, next: usize) -> Result<(), PipelineError> {
        self.ensure_in_progress()?;
        self.cursor = next;
        self.retry_spent = false;
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Merges a passing stage's caption and assets into the deliverable.
    pub fn ingest(
        &mut self,
        caption: Option<String>,
        assets: Vec<AssetRef>,
    ) -> Result<(), PipelineError> {
        self.ensure_in_progress()?;
        if caption.is_some() {
            self.deliverable.caption = caption;
        }
        for asset in assets {
            if !self
                .deliverable
                .assets
                .iter()
                .any(|a| a.fingerprint == asset.fingerprint)
            {
                self.deliverable.assets.push(asset);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> Item {
        Item::new(TopicLabel::new("hydration myths").unwrap(), SafetyTier::Safe, 0)
    }

    fn record(stage: &str, outcome: StageOutcome) -> StageRecord {
        StageRecord {
            stage: StageId::new(stage).unwrap(),
            outcome,
            attempt: 1,
            at: Timestamp::now(),
            verdict: None,
            fail_reasons: Vec::new(),
            notes: None,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut item = item();
        assert_eq!(item.state(), LifecycleState::Pending);
        item.start().unwrap();
        item.record_stage(record("topic", StageOutcome::Pass)).unwrap();
        item.advance_to(1).unwrap();
        item.mark_published().unwrap();
        assert_eq!(item.state(), LifecycleState::Published);
    }

    #[test]
    fn terminal_items_reject_every_mutation() {
        let mut item = item();
        item.start().unwrap();
        item.terminate(TerminationReason::OperatorClosed {
            reason: "off-brand".into(),
        })
        .unwrap();
        assert!(item.needs_human_review());
        assert!(item.start().is_err());
        assert!(item.resume().is_err());
        assert!(item.mark_published().is_err());
        assert!(item.record_stage(record("topic", StageOutcome::Pass)).is_err());
        assert!(item.advance_to(3).is_err());
        assert_eq!(item.state(), LifecycleState::Terminated);
    }

    #[test]
    fn automatic_retry_is_granted_once_per_stage() {
        let mut item = item();
        item.start().unwrap();
        let blocked = BlockReason::StageFailed {
            stage: StageId::new("fact-check").unwrap(),
            fail_reasons: vec![FailReason::LowTotal],
        };
        item.block(blocked.clone()).unwrap();
        assert!(item.automatic_retry_available());
        item.begin_automatic_retry().unwrap();
        item.block(blocked.clone()).unwrap();
        assert!(!item.automatic_retry_available());
        assert!(item.begin_automatic_retry().is_err());

        item.resume().unwrap();
        item.block(blocked).unwrap();
        assert!(item.automatic_retry_available());
    }

    #[test]
    fn publish_block_has_no_automatic_retry() {
        let mut item = item();
        item.start().unwrap();
        item.block(BlockReason::PublishFailed {
            failures: BTreeMap::new(),
            retryable: true,
        })
        .unwrap();
        assert!(!item.automatic_retry_available());
    }

    #[test]
    fn pending_cannot_publish_directly() {
        let mut item = item();
        let err = item.mark_published().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[test]
    fn has_passed_looks_at_latest_attempt() {
        let mut item = item();
        item.start().unwrap();
        item.record_stage(record("review", StageOutcome::Fail)).unwrap();
        assert!(!item.has_passed(&StageId::new("review").unwrap()));
        item.record_stage(record("review", StageOutcome::Pass)).unwrap();
        assert!(item.has_passed(&StageId::new("review").unwrap()));
        assert_eq!(item.attempts(&StageId::new("review").unwrap()), 2);
    }

    #[test]
    fn stage_record_without_notes_still_loads() {
        let mut value = serde_json::to_value(record("review", StageOutcome::Pass)).unwrap();
        assert!(value.get("notes").is_none());
        value["notes"] = serde_json::Value::Null;
        let parsed: StageRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.notes, None);

        let mut noted = record("review", StageOutcome::Pass);
        noted.notes = Some("two sources disagree".into());
        let parsed: StageRecord =
            serde_json::from_value(serde_json::to_value(&noted).unwrap()).unwrap();
        assert_eq!(parsed, noted);
    }
}
