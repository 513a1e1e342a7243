//! Stage Registry: the single lookup table of tier-specific stage rules.
//!
//! The registry declares the ordered list of stages and, per [`SafetyTier`],
//! which stage identifiers are mandatory, forbidden, or substituted. Every
//! tier-dependent structural decision the executor makes goes through
//! [`StageRegistry::plan_for`]; nothing else branches on the tier.
//!
//! Inconsistent tier rules are data-integrity bugs. They are rejected by
//! [`StageRegistry::from_config`] at load time, never at execution time.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::{PipelineError, RubricName, SafetyTier, StageId};

/// Whether a stage produces content or judges it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Successful production is itself the PASS verdict.
    #[default]
    Production,
    /// The artifact is scored against the stage's rubric.
    Review,
}

/// One planned stage for a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub kind: StageKind,
    /// Rubric for review stages.
    pub rubric: Option<RubricName>,
    /// Must PASS before the item may reach publish.
    pub required: bool,
    /// Skipped silently; its content must never appear in the item's artifacts.
    pub forbidden_in_tier: bool,
}

/// Ordered stage plan for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    tier: SafetyTier,
    stages: Vec<StageSpec>,
    forbidden: BTreeSet<StageId>,
}

impl StagePlan {
    pub fn tier(&self) -> SafetyTier {
        self.tier
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, id: &StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// Index of `id` in the plan, used to resolve a directive's starting stage.
    pub fn position_of(&self, id: &StageId) -> Option<usize> {
        self.stages.iter().position(|s| &s.id == id)
    }

    /// Whether content of stage `id` is blocked for this tier.
    ///
    /// Covers alternates that are forbidden but not part of the plan.
    pub fn is_forbidden(&self, id: &StageId) -> bool {
        self.forbidden.contains(id)
    }

    /// Mandatory stages at or after `start`, in plan order.
    pub fn required_from(&self, start: usize) -> impl Iterator<Item = &StageSpec> {
        self.stages
            .iter()
            .skip(start)
            .filter(|s| s.required && !s.forbidden_in_tier)
    }
}

/// Tier → stage plan lookup, built once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRegistry {
    // Indexed by `SafetyTier as usize`; one entry per tier in `SafetyTier::ALL` order.
    plans: Vec<StagePlan>,
}

impl StageRegistry {
    /// Builds and validates the registry.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let mut declared: BTreeMap<StageId, (StageKind, Option<RubricName>, bool)> =
            BTreeMap::new();
        let mut base_order = Vec::new();

        for stage in &config.stages {
            let id = StageId::new(stage.id.as_str())
                .ok_or_else(|| PipelineError::config("stage ids must be non-empty"))?;
            let rubric = match (stage.kind, &stage.rubric) {
                (StageKind::Review, Some(name)) => {
                    if !config.rubrics.contains_key(name) {
                        return Err(PipelineError::config(format!(
                            "review stage '{id}' references unknown rubric '{name}'"
                        )));
                    }
                    RubricName::new(name.as_str())
                }
                (StageKind::Review, None) => {
                    return Err(PipelineError::config(format!(
                        "review stage '{id}' has no rubric"
                    )));
                }
                (StageKind::Production, Some(_)) => {
                    return Err(PipelineError::config(format!(
                        "production stage '{id}' cannot carry a rubric"
                    )));
                }
                (StageKind::Production, None) => None,
            };
            if declared
                .insert(id.clone(), (stage.kind, rubric, stage.alternate))
                .is_some()
            {
                return Err(PipelineError::config(format!(
                    "stage '{id}' is declared twice"
                )));
            }
            if !stage.alternate {
                base_order.push(id);
            }
        }

        if base_order.is_empty() {
            return Err(PipelineError::config(
                "at least one non-alternate stage must be declared",
            ));
        }

        for name in config.tiers.keys() {
            if name.parse::<SafetyTier>().is_err() {
                return Err(PipelineError::config(format!("unknown tier '{name}'")));
            }
        }

        let mut plans = Vec::with_capacity(SafetyTier::ALL.len());
        for tier in SafetyTier::ALL {
            let rules = config
                .tiers
                .iter()
                .find(|(name, _)| name.parse::<SafetyTier>().ok() == Some(tier))
                .map(|(_, rules)| rules)
                .ok_or_else(|| {
                    PipelineError::config(format!("tier '{tier}' has no stage rules"))
                })?;

            let resolve = |raw: &String| -> Result<StageId, PipelineError> {
                StageId::new(raw.as_str())
                    .filter(|id| declared.contains_key(id))
                    .ok_or_else(|| {
                        PipelineError::config(format!(
                            "tier '{tier}' references unknown stage '{raw}'"
                        ))
                    })
            };

            let required = rules
                .required
                .iter()
                .map(&resolve)
                .collect::<Result<BTreeSet<_>, _>>()?;
            let forbidden = rules
                .forbidden
                .iter()
                .map(&resolve)
                .collect::<Result<BTreeSet<_>, _>>()?;

            if let Some(overlap) = required.intersection(&forbidden).next() {
                return Err(PipelineError::config(format!(
                    "tier '{tier}' marks stage '{overlap}' both required and forbidden"
                )));
            }

            let mut substitutions = BTreeMap::new();
            for (from, to) in &rules.substitute {
                let from = resolve(from)?;
                let to = resolve(to)?;
                if !base_order.contains(&from) {
                    return Err(PipelineError::config(format!(
                        "tier '{tier}' substitutes '{from}', which is not in the base order"
                    )));
                }
                if !matches!(declared.get(&to), Some((_, _, true))) {
                    return Err(PipelineError::config(format!(
                        "tier '{tier}' substitutes in '{to}', which is not declared alternate"
                    )));
                }
                substitutions.insert(from, to);
            }

            let mut stages = Vec::with_capacity(base_order.len());
            for base in &base_order {
                let id = substitutions.get(base).unwrap_or(base).clone();
                let (kind, rubric, _) = declared
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| PipelineError::config(format!("stage '{id}' vanished")))?;
                stages.push(StageSpec {
                    required: required.contains(&id),
                    forbidden_in_tier: forbidden.contains(&id),
                    id,
                    kind,
                    rubric,
                });
            }

            if let Some(unplanned) = required
                .iter()
                .find(|id| !stages.iter().any(|s| &s.id == *id))
            {
                return Err(PipelineError::config(format!(
                    "tier '{tier}' requires stage '{unplanned}', which its plan never runs"
                )));
            }

            plans.push(StagePlan {
                tier,
                stages,
                forbidden,
            });
        }

        Ok(Self { plans })
    }

    /// Ordered stage plan for `tier`. Pure lookup.
    pub fn plan_for(&self, tier: SafetyTier) -> &StagePlan {
        &self.plans[tier as usize]
    }
}
