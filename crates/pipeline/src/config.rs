//! Pipeline configuration model.
//!
//! [`PipelineConfig`] is the raw, deserialised form of the `[pipeline]` part
//! of `contentworks.toml`. [`PipelineConfig::validate`] turns it into a
//! [`LoadedConfig`] exactly once at startup; every configuration-time error
//! (overlapping required/forbidden stage sets, unpassable rubrics, zero
//! thresholds, ...) surfaces there, before any item is processed.
//!
//! A [`LoadedConfig`] is immutable for the process lifetime and is shared as
//! `Arc<LoadedConfig>`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::escalation::EscalationThresholds;
use crate::registry::{StageKind, StageRegistry, StageSpec};
use crate::scoring::Rubric;
use crate::{DestinationId, PipelineError, RubricName};

// ---------------------------------------------------------------------------
// Raw configuration
// ---------------------------------------------------------------------------

/// Raw pipeline configuration as read from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Every stage, in execution order. Alternates are only reachable through
    /// a tier substitution.
    pub stages: Vec<StageConfig>,

    /// Named rubrics referenced by review stages.
    #[serde(default)]
    pub rubrics: BTreeMap<String, RubricConfig>,

    /// Per-tier stage rules, keyed by lowercase tier name.
    pub tiers: BTreeMap<String, TierConfig>,

    #[serde(default)]
    pub escalation: EscalationConfig,

    pub publish: PublishConfig,
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub id: String,

    #[serde(default)]
    pub kind: StageKind,

    /// Rubric name; required for review stages, ignored otherwise.
    #[serde(default)]
    pub rubric: Option<String>,

    /// Excluded from the base order; only runs when a tier substitutes it in.
    #[serde(default)]
    pub alternate: bool,
}

/// One `[rubrics.<name>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RubricConfig {
    /// Minimum weighted total for a PASS, in the same units as the total.
    pub pass_threshold: u32,

    #[serde(default)]
    pub min_rating: u8,

    #[serde(default = "default_max_rating")]
    pub max_rating: u8,

    pub dimensions: BTreeMap<String, CriterionConfig>,
}

/// One rubric dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CriterionConfig {
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Raw rating this dimension must reach regardless of the total.
    pub minimum: u8,
}

/// One `[tiers.<tier>]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    #[serde(default)]
    pub required: Vec<String>,

    #[serde(default)]
    pub forbidden: Vec<String>,

    /// `base stage -> alternate stage` replacements for this tier.
    #[serde(default)]
    pub substitute: BTreeMap<String, String>,
}

/// `[escalation]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    #[serde(default = "default_item_threshold")]
    pub item_failure_threshold: u32,

    #[serde(default = "default_cohort_threshold")]
    pub cohort_failure_threshold: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            item_failure_threshold: default_item_threshold(),
            cohort_failure_threshold: default_cohort_threshold(),
        }
    }
}

/// `[publish]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Fixed wait before the single retry after a rate-limit signal.
    #[serde(default = "default_backoff_ms")]
    pub rate_limit_backoff_ms: u64,

    /// Destination platforms every item is published to.
    pub destinations: Vec<String>,
}

fn default_max_rating() -> u8 {
    5
}

fn default_weight() -> u32 {
    1
}

fn default_item_threshold() -> u32 {
    2
}

fn default_cohort_threshold() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Publish settings after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub rate_limit_backoff: Duration,
    pub destinations: Vec<DestinationId>,
}

/// Validated, immutable pipeline configuration.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    registry: StageRegistry,
    rubrics: BTreeMap<RubricName, Rubric>,
    escalation: EscalationThresholds,
    publish: PublishSettings,
}

impl LoadedConfig {
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Rubric used to score `stage`, if it is a review stage.
    pub fn rubric_for(&self, stage: &StageSpec) -> Option<&Rubric> {
        match stage.kind {
            StageKind::Review => stage.rubric.as_ref().and_then(|name| self.rubrics.get(name)),
            StageKind::Production => None,
        }
    }

    pub fn escalation(&self) -> EscalationThresholds {
        self.escalation
    }

    pub fn publish(&self) -> &PublishSettings {
        &self.publish
    }
}

impl PipelineConfig {
    /// Validates the raw configuration and builds the immutable runtime form.
    pub fn validate(&self) -> Result<LoadedConfig, PipelineError> {
        let mut rubrics = BTreeMap::new();
        for (name, raw) in &self.rubrics {
            let rubric_name = RubricName::new(name.as_str())
                .ok_or_else(|| PipelineError::config("rubric names must be non-empty"))?;
            let rubric = Rubric::from_config(&rubric_name, raw)?;
            rubrics.insert(rubric_name, rubric);
        }

        let registry = StageRegistry::from_config(self)?;

        let escalation = EscalationThresholds::new(
            self.escalation.item_failure_threshold,
            self.escalation.cohort_failure_threshold,
        )?;

        if self.publish.destinations.is_empty() {
            return Err(PipelineError::config(
                "publish.destinations must list at least one destination",
            ));
        }
        let mut destinations = Vec::with_capacity(self.publish.destinations.len());
        for raw in &self.publish.destinations {
            let destination = DestinationId::new(raw.as_str())
                .ok_or_else(|| PipelineError::config("destination names must be non-empty"))?;
            if destinations.contains(&destination) {
                return Err(PipelineError::config(format!(
                    "destination '{destination}' is listed twice"
                )));
            }
            destinations.push(destination);
        }

        Ok(LoadedConfig {
            registry,
            rubrics,
            escalation,
            publish: PublishSettings {
                rate_limit_backoff: Duration::from_millis(self.publish.rate_limit_backoff_ms),
                destinations,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SafetyTier, StageId};

    const EXAMPLE: &str = include_str!("../../../config/contentworks.example.toml");

    fn example() -> PipelineConfig {
        #[derive(Deserialize)]
        struct Wrapper {
            pipeline: PipelineConfig,
        }
        let wrapper: Wrapper = toml::from_str(EXAMPLE).expect("example config parses");
        wrapper.pipeline
    }

    #[test]
    fn example_config_validates() {
        let loaded = example().validate().expect("example config is valid");
        assert_eq!(loaded.escalation().item_failure_threshold(), 2);
        assert_eq!(loaded.escalation().cohort_failure_threshold(), 3);
        assert!(!loaded.publish().destinations.is_empty());

        let plan = loaded.registry().plan_for(SafetyTier::Safe);
        let review = plan
            .stages()
            .iter()
            .find(|s| s.kind == StageKind::Review)
            .expect("example has a review stage");
        assert!(loaded.rubric_for(review).is_some());
    }

    #[test]
    fn forbidden_tier_blocks_dosage_stage_in_example() {
        let loaded = example().validate().unwrap();
        let plan = loaded.registry().plan_for(SafetyTier::Forbidden);
        let dosage = StageId::new("amount-and-dosage").unwrap();
        let spec = plan.get(&dosage).expect("stage present in plan");
        assert!(spec.forbidden_in_tier);
    }

    #[test]
    fn empty_destination_list_is_rejected() {
        let mut config = example();
        config.publish.destinations.clear();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::ConfigurationError { .. }));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut config = example();
        config.escalation.item_failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
