//! Escalation Tracker: bounded failure counters with circuit-breaker signals.
//!
//! A run of failures is treated as evidence of a broken upstream input (bad
//! template, stale data) rather than bad luck. Two counters are kept:
//!
//! - **Item scope**, keyed by `(item, stage)`. Reaching
//!   [`EscalationThresholds::item_failure_threshold`] consecutive FAILs emits
//!   [`EscalationSignal::ItemTermination`].
//! - **Cohort scope**, keyed by `(cohort, stage)`. Reaching
//!   [`EscalationThresholds::cohort_failure_threshold`] consecutive FAILs of
//!   one stage across *distinct* items emits
//!   [`EscalationSignal::BatchTermination`] and latches the whole cohort as
//!   halted until [`EscalationTracker::reset_cohort`].
//!
//! A PASS resets its key's counter to zero; nothing else ever decrements it.
//! Cohort counters are per stage so that items passing the healthy stages in
//! front of a broken one do not keep clearing its count.
//! The tracker is plain data guarded by the caller: every FAIL/PASS event is a
//! single `&mut self` call, so one lock around the tracker makes each
//! read-modify-write atomic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{CohortKey, ItemId, PipelineError, StageId};

/// Consecutive-failure thresholds. Both are product decisions, not constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationThresholds {
    item: u32,
    cohort: u32,
}

impl EscalationThresholds {
    /// Rejects zero thresholds, which would terminate on the first result.
    pub fn new(item: u32, cohort: u32) -> Result<Self, PipelineError> {
        if item == 0 || cohort == 0 {
            return Err(PipelineError::config(
                "escalation thresholds must be at least 1",
            ));
        }
        Ok(Self { item, cohort })
    }

    pub fn item_failure_threshold(self) -> u32 {
        self.item
    }

    pub fn cohort_failure_threshold(self) -> u32 {
        self.cohort
    }
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self { item: 2, cohort: 3 }
    }
}

/// Which counter a result is recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscalationKey {
    Item { item: ItemId, stage: StageId },
    /// `item` identifies the contributor so repeat failures of one item count once.
    Cohort {
        cohort: CohortKey,
        stage: StageId,
        item: ItemId,
    },
}

/// Derived termination event. Never raised directly by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationSignal {
    /// Below threshold (or a PASS); keep going.
    Continue,
    ItemTermination {
        stage: StageId,
        consecutive_failures: u32,
    },
    BatchTermination {
        cohort: CohortKey,
        stage: StageId,
        consecutive_failures: u32,
    },
}

impl EscalationSignal {
    pub fn is_termination(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Counter state of one cohort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortCounter {
    /// Per stage, the distinct items that failed it since its last PASS in the cohort.
    #[serde(default)]
    pub failing: BTreeMap<StageId, BTreeSet<ItemId>>,
    /// Latched by a batch termination; cleared only by a manual reset.
    pub halted: bool,
}

/// Serializable snapshot of every counter, persisted after each mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationState {
    pub items: BTreeMap<ItemId, BTreeMap<StageId, u32>>,
    pub cohorts: BTreeMap<CohortKey, CohortCounter>,
}

/// Failure counters plus thresholds.
#[derive(Debug, Clone)]
pub struct EscalationTracker {
    thresholds: EscalationThresholds,
    state: EscalationState,
}

impl EscalationTracker {
    pub fn new(thresholds: EscalationThresholds) -> Self {
        Self::with_state(thresholds, EscalationState::default())
    }

    /// Restores a tracker from persisted state.
    pub fn with_state(thresholds: EscalationThresholds, state: EscalationState) -> Self {
        Self { thresholds, state }
    }

    /// Records one FAIL/PASS event and returns the resulting signal.
    pub fn record_result(&mut self, key: &EscalationKey, passed: bool) -> EscalationSignal {
        match key {
            EscalationKey::Item { item, stage } => {
                let counters = self.state.items.entry(*item).or_default();
                if passed {
                    counters.remove(stage);
                    if counters.is_empty() {
                        self.state.items.remove(item);
                    }
                    return EscalationSignal::Continue;
                }
                let count = counters.entry(stage.clone()).or_insert(0);
                *count = count.saturating_add(1);
                if *count >= self.thresholds.item {
                    EscalationSignal::ItemTermination {
                        stage: stage.clone(),
                        consecutive_failures: *count,
                    }
                } else {
                    EscalationSignal::Continue
                }
            }
            EscalationKey::Cohort {
                cohort,
                stage,
                item,
            } => {
                let counter = self.state.cohorts.entry(cohort.clone()).or_default();
                if passed {
                    counter.failing.remove(stage);
                    return EscalationSignal::Continue;
                }
                let failing = counter.failing.entry(stage.clone()).or_default();
                failing.insert(*item);
                let count = u32::try_from(failing.len()).unwrap_or(u32::MAX);
                if count >= self.thresholds.cohort {
                    counter.halted = true;
                    EscalationSignal::BatchTermination {
                        cohort: cohort.clone(),
                        stage: stage.clone(),
                        consecutive_failures: count,
                    }
                } else {
                    EscalationSignal::Continue
                }
            }
        }
    }

    pub fn item_failures(&self, item: ItemId, stage: &StageId) -> u32 {
        self.state
            .items
            .get(&item)
            .and_then(|c| c.get(stage))
            .copied()
            .unwrap_or(0)
    }

    pub fn cohort_failures(&self, cohort: &CohortKey, stage: &StageId) -> u32 {
        self.state
            .cohorts
            .get(cohort)
            .and_then(|c| c.failing.get(stage))
            .map(|items| u32::try_from(items.len()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Drops the item-scope counters of an item that reached a terminal state.
    ///
    /// Its cohort contributions stay: they are what a batch termination counts.
    pub fn forget_item(&mut self, item: ItemId) -> bool {
        self.state.items.remove(&item).is_some()
    }

    /// Whether new items in `cohort` must not be started.
    pub fn is_cohort_halted(&self, cohort: &CohortKey) -> bool {
        self.state.cohorts.get(cohort).is_some_and(|c| c.halted)
    }

    /// Manual reset of a cohort's breaker. Returns whether it was halted.
    pub fn reset_cohort(&mut self, cohort: &CohortKey) -> bool {
        match self.state.cohorts.remove(cohort) {
            Some(counter) => counter.halted,
            None => false,
        }
    }

    pub fn thresholds(&self) -> EscalationThresholds {
        self.thresholds
    }

    pub fn state(&self) -> &EscalationState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> StageId {
        StageId::new("fact-check").unwrap()
    }

    fn item_key(item: ItemId) -> EscalationKey {
        EscalationKey::Item {
            item,
            stage: stage(),
        }
    }

    fn cohort_key(item: ItemId) -> EscalationKey {
        cohort_stage_key(item, stage())
    }

    fn cohort_stage_key(item: ItemId, stage: StageId) -> EscalationKey {
        EscalationKey::Cohort {
            cohort: CohortKey::new("safe").unwrap(),
            stage,
            item,
        }
    }

    #[test]
    fn item_terminates_on_second_consecutive_fail_not_first() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let item = ItemId::new_random();
        assert_eq!(tracker.record_result(&item_key(item), false), EscalationSignal::Continue);
        assert_eq!(
            tracker.record_result(&item_key(item), false),
            EscalationSignal::ItemTermination {
                stage: stage(),
                consecutive_failures: 2
            }
        );
    }

    #[test]
    fn intervening_pass_resets_item_counter() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let item = ItemId::new_random();
        tracker.record_result(&item_key(item), false);
        tracker.record_result(&item_key(item), true);
        assert_eq!(tracker.item_failures(item, &stage()), 0);
        assert_eq!(tracker.record_result(&item_key(item), false), EscalationSignal::Continue);
    }

    #[test]
    fn item_counters_are_per_stage() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let item = ItemId::new_random();
        tracker.record_result(&item_key(item), false);
        let other = EscalationKey::Item {
            item,
            stage: StageId::new("copy-review").unwrap(),
        };
        assert_eq!(tracker.record_result(&other, false), EscalationSignal::Continue);
    }

    #[test]
    fn cohort_terminates_on_third_distinct_item() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let items = [ItemId::new_random(), ItemId::new_random(), ItemId::new_random()];
        assert!(!tracker.record_result(&cohort_key(items[0]), false).is_termination());
        assert!(!tracker.record_result(&cohort_key(items[1]), false).is_termination());
        let signal = tracker.record_result(&cohort_key(items[2]), false);
        assert!(matches!(
            signal,
            EscalationSignal::BatchTermination { consecutive_failures: 3, .. }
        ));
        assert!(tracker.is_cohort_halted(&CohortKey::new("safe").unwrap()));
    }

    #[test]
    fn repeat_failures_of_one_item_count_once_for_the_cohort() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let a = ItemId::new_random();
        let b = ItemId::new_random();
        tracker.record_result(&cohort_key(a), false);
        tracker.record_result(&cohort_key(a), false);
        assert!(!tracker.record_result(&cohort_key(b), false).is_termination());
        assert_eq!(
            tracker.cohort_failures(&CohortKey::new("safe").unwrap(), &stage()),
            2
        );
    }

    #[test]
    fn pass_of_the_stage_in_cohort_resets_counter_but_not_halt() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let cohort = CohortKey::new("safe").unwrap();
        tracker.record_result(&cohort_key(ItemId::new_random()), false);
        tracker.record_result(&cohort_key(ItemId::new_random()), false);
        tracker.record_result(&cohort_key(ItemId::new_random()), true);
        assert_eq!(tracker.cohort_failures(&cohort, &stage()), 0);

        for _ in 0..3 {
            tracker.record_result(&cohort_key(ItemId::new_random()), false);
        }
        tracker.record_result(&cohort_key(ItemId::new_random()), true);
        assert!(tracker.is_cohort_halted(&cohort));
        assert!(tracker.reset_cohort(&cohort));
        assert!(!tracker.is_cohort_halted(&cohort));
    }

    #[test]
    fn pass_of_another_stage_does_not_clear_a_failing_stage() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let topic = StageId::new("topic-selection").unwrap();
        let mut last = EscalationSignal::Continue;
        for _ in 0..3 {
            let item = ItemId::new_random();
            tracker.record_result(&cohort_stage_key(item, topic.clone()), true);
            last = tracker.record_result(&cohort_key(item), false);
        }
        assert_eq!(
            last,
            EscalationSignal::BatchTermination {
                cohort: CohortKey::new("safe").unwrap(),
                stage: stage(),
                consecutive_failures: 3,
            }
        );
    }

    #[test]
    fn forgetting_an_item_keeps_its_cohort_contribution() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let item = ItemId::new_random();
        tracker.record_result(&item_key(item), false);
        tracker.record_result(&cohort_key(item), false);
        assert!(tracker.forget_item(item));
        assert!(tracker.state().items.is_empty());
        assert_eq!(
            tracker.cohort_failures(&CohortKey::new("safe").unwrap(), &stage()),
            1
        );
        assert!(!tracker.forget_item(item));
    }

    #[test]
    fn state_survives_snapshot_restore() {
        let mut tracker = EscalationTracker::new(EscalationThresholds::default());
        let item = ItemId::new_random();
        tracker.record_result(&item_key(item), false);
        let json = serde_json::to_string(tracker.state()).unwrap();
        let restored: EscalationState = serde_json::from_str(&json).unwrap();
        let mut tracker = EscalationTracker::with_state(EscalationThresholds::default(), restored);
        assert!(tracker.record_result(&item_key(item), false).is_termination());
    }

    #[test]
    fn zero_threshold_rejected() {
        assert!(EscalationThresholds::new(0, 3).is_err());
        assert!(EscalationThresholds::new(2, 0).is_err());
    }
}
