//! Shared value types for the ContentWorks pipeline domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (e.g. fingerprints are always 64 lowercase
//! hex characters, the tier set is closed) and participate in domain decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CohortKey;

// ---------------------------------------------------------------------------
// Safety tier
// ---------------------------------------------------------------------------

/// Closed classification of an item that drives which stages are mandatory,
/// forbidden, or substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyTier {
    Safe,
    Caution,
    Danger,
    Forbidden,
}

impl SafetyTier {
    /// Every tier, in severity order.
    pub const ALL: [SafetyTier; 4] = [
        SafetyTier::Safe,
        SafetyTier::Caution,
        SafetyTier::Danger,
        SafetyTier::Forbidden,
    ];

    /// Lowercase configuration key for this tier (`[tiers.safe]`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Caution => "caution",
            Self::Danger => "danger",
            Self::Forbidden => "forbidden",
        }
    }

    /// Cohort over which failures of items in this tier are aggregated.
    pub fn cohort_key(self) -> CohortKey {
        CohortKey::from(self)
    }
}

impl std::fmt::Display for SafetyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SafetyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SafetyTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown safety tier '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Content addressing
// ---------------------------------------------------------------------------

/// SHA-256 fingerprint of asset bytes, hex encoded.
///
/// Identical assets reused across destinations share a fingerprint, which is
/// the key of the system-wide upload cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetFingerprint(String);

impl AssetFingerprint {
    /// Computes the fingerprint of `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Parses a hex fingerprint, returning `None` unless it is 64 hex characters.
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Returns the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars) for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for AssetFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference from an item's deliverable to an asset held in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Content fingerprint of the asset bytes.
    pub fingerprint: AssetFingerprint,
    /// File name suggested by the producing stage (e.g. `"cover.png"`).
    pub name: String,
    /// MIME type (e.g. `"image/png"`).
    pub media_type: String,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("SAFE".parse::<SafetyTier>().unwrap(), SafetyTier::Safe);
        assert_eq!("danger".parse::<SafetyTier>().unwrap(), SafetyTier::Danger);
        assert!("spicy".parse::<SafetyTier>().is_err());
    }

    #[test]
    fn tier_serializes_screaming_case() {
        let json = serde_json::to_string(&SafetyTier::Forbidden).unwrap();
        assert_eq!(json, "\"FORBIDDEN\"");
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = AssetFingerprint::compute(b"cover");
        assert_eq!(a, AssetFingerprint::compute(b"cover"));
        assert_ne!(a, AssetFingerprint::compute(b"cover2"));
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(AssetFingerprint::parse(a.as_str()), Some(a.clone()));
        assert!(AssetFingerprint::parse("abcd").is_none());
    }
}
