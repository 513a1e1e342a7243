//! What a stage producer hands back to the executor.
//!
//! The orchestrator does not look inside an artifact beyond the fields here:
//! review ratings for the scoring engine, content markers for the forbidden
//! stage check, and the caption/assets that end up in the item's deliverable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{DimensionName, StageId};

/// Output of one stage producer call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Artifact {
    /// Per-dimension ratings; only meaningful for review stages.
    pub ratings: BTreeMap<DimensionName, u8>,

    /// Stage ids whose content this artifact contains.
    ///
    /// A marker naming a stage forbidden for the item's tier is a hard
    /// content block.
    pub content_markers: BTreeSet<StageId>,

    /// Caption to post; the last passing stage that sets one wins.
    pub caption: Option<String>,

    /// Media produced by the stage.
    pub assets: Vec<AssetPayload>,

    /// Free-form producer notes kept for operator diagnosis.
    pub notes: Option<String>,
}

/// Raw media produced by a stage, before it is stored content-addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPayload {
    pub name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// First content marker that is forbidden according to `is_forbidden`.
    pub fn forbidden_marker(&self, is_forbidden: impl Fn(&StageId) -> bool) -> Option<&StageId> {
        self.content_markers.iter().find(|m| is_forbidden(m))
    }
}
