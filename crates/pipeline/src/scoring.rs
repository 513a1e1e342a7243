//! Scoring Engine: deterministic rubric evaluation of review artifacts.
//!
//! [`score`] is a pure function. For identical artifact and rubric inputs the
//! returned [`Verdict`] is identical down to its serialised bytes, which is
//! what makes golden-sample regression tests possible. Dimensions are kept in
//! `BTreeMap`s so iteration order (and therefore fail-reason order) never
//! depends on hashing.
//!
//! A verdict passes only when `total >= pass_threshold` **and** every
//! dimension reaches its own minimum. A weak dimension cannot be averaged away
//! by strong ones elsewhere.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::config::RubricConfig;
use crate::{DimensionName, PipelineError, RubricName, StageId};

// ---------------------------------------------------------------------------
// Rubric
// ---------------------------------------------------------------------------

/// Weight and minimum raw rating for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub weight: u32,
    pub minimum: u8,
}

/// Validated scoring rubric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    name: RubricName,
    dimensions: BTreeMap<DimensionName, Criterion>,
    pass_threshold: u32,
    min_rating: u8,
    max_rating: u8,
}

impl Rubric {
    /// Builds a rubric, rejecting configurations no artifact could pass.
    pub fn new(
        name: RubricName,
        dimensions: BTreeMap<DimensionName, Criterion>,
        pass_threshold: u32,
        min_rating: u8,
        max_rating: u8,
    ) -> Result<Self, PipelineError> {
        if dimensions.is_empty() {
            return Err(PipelineError::config(format!(
                "rubric '{name}' has no dimensions"
            )));
        }
        if min_rating > max_rating {
            return Err(PipelineError::config(format!(
                "rubric '{name}' rating range {min_rating}..={max_rating} is empty"
            )));
        }
        for (dimension, criterion) in &dimensions {
            if !(min_rating..=max_rating).contains(&criterion.minimum) {
                return Err(PipelineError::config(format!(
                    "rubric '{name}' dimension '{dimension}' minimum {} is outside {min_rating}..={max_rating}",
                    criterion.minimum
                )));
            }
        }
        let rubric = Self {
            name,
            dimensions,
            pass_threshold,
            min_rating,
            max_rating,
        };
        if rubric.max_total() < pass_threshold {
            return Err(PipelineError::config(format!(
                "rubric '{}' threshold {pass_threshold} exceeds the best possible total {}",
                rubric.name,
                rubric.max_total()
            )));
        }
        Ok(rubric)
    }

    pub(crate) fn from_config(name: &RubricName, raw: &RubricConfig) -> Result<Self, PipelineError> {
        let mut dimensions = BTreeMap::new();
        for (dimension, criterion) in &raw.dimensions {
            let dimension = DimensionName::new(dimension.as_str()).ok_or_else(|| {
                PipelineError::config(format!("rubric '{name}' has an empty dimension name"))
            })?;
            dimensions.insert(
                dimension,
                Criterion {
                    weight: criterion.weight,
                    minimum: criterion.minimum,
                },
            );
        }
        Self::new(
            name.clone(),
            dimensions,
            raw.pass_threshold,
            raw.min_rating,
            raw.max_rating,
        )
    }

    pub fn name(&self) -> &RubricName {
        &self.name
    }

    pub fn dimensions(&self) -> &BTreeMap<DimensionName, Criterion> {
        &self.dimensions
    }

    pub fn pass_threshold(&self) -> u32 {
        self.pass_threshold
    }

    /// Highest total an artifact can reach under this rubric.
    pub fn max_total(&self) -> u32 {
        self.dimensions.values().fold(0u32, |acc, c| {
            acc.saturating_add(c.weight.saturating_mul(u32::from(self.max_rating)))
        })
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Reason code attached to a FAIL.
///
/// Serialised as `{"code": "BELOW_MINIMUM", "dimension": "hook"}` etc.; the
/// [`std::fmt::Display`] form (`BELOW_MINIMUM:hook`) is what operators see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    /// A dimension rated under its minimum.
    BelowMinimum { dimension: DimensionName },
    /// The weighted total missed the threshold.
    LowTotal,
    /// The stage producer returned no artifact.
    ProducerError { message: String },
    /// The artifact carried content of a stage forbidden for the item's tier.
    ForbiddenContent { stage: StageId },
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BelowMinimum { dimension } => write!(f, "BELOW_MINIMUM:{dimension}"),
            Self::LowTotal => f.write_str("LOW_TOTAL"),
            Self::ProducerError { .. } => f.write_str("PRODUCER_ERROR"),
            Self::ForbiddenContent { stage } => write!(f, "FORBIDDEN_CONTENT:{stage}"),
        }
    }
}

/// Score breakdown of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionScore {
    /// Rating after clamping into the rubric's range.
    pub rating: u8,
    pub weight: u32,
    /// `weight * rating`.
    pub weighted: u32,
    pub minimum: u8,
}

impl DimensionScore {
    pub fn meets_minimum(&self) -> bool {
        self.rating >= self.minimum
    }
}

/// Structured PASS/FAIL result of a review stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub rubric: RubricName,
    pub scores: BTreeMap<DimensionName, DimensionScore>,
    pub total: u32,
    pub pass_threshold: u32,
    pub passed: bool,
    /// One `BelowMinimum` per failing dimension in rubric order, then `LowTotal`.
    pub fail_reasons: Vec<FailReason>,
}

/// Evaluates `artifact` against `rubric`.
///
/// Missing dimensions rate at the bottom of the range; out-of-range ratings
/// are clamped into it. Ratings for dimensions the rubric does not know are
/// ignored.
pub fn score(artifact: &Artifact, rubric: &Rubric) -> Verdict {
    let mut scores = BTreeMap::new();
    let mut fail_reasons = Vec::new();
    let mut total = 0u32;

    for (dimension, criterion) in &rubric.dimensions {
        let raw = artifact
            .ratings
            .get(dimension)
            .copied()
            .unwrap_or(rubric.min_rating);
        let rating = raw.clamp(rubric.min_rating, rubric.max_rating);
        let weighted = criterion.weight.saturating_mul(u32::from(rating));
        total = total.saturating_add(weighted);

        let dimension_score = DimensionScore {
            rating,
            weight: criterion.weight,
            weighted,
            minimum: criterion.minimum,
        };
        if !dimension_score.meets_minimum() {
            fail_reasons.push(FailReason::BelowMinimum {
                dimension: dimension.clone(),
            });
        }
        scores.insert(dimension.clone(), dimension_score);
    }

    if total < rubric.pass_threshold {
        fail_reasons.push(FailReason::LowTotal);
    }

    Verdict {
        rubric: rubric.name.clone(),
        scores,
        total,
        pass_threshold: rubric.pass_threshold,
        passed: fail_reasons.is_empty(),
        fail_reasons,
    }
}
