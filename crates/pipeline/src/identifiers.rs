//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`StageId`] with a [`DestinationId`] even though both are strings under the
//! hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for UUID-wrapped newtypes (internally generated).
// Generates: struct (Copy), new_random(), from_uuid(), as_uuid(), Display, FromStr.
// ---------------------------------------------------------------------------
macro_rules! uuid_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID (e.g. deserialised from state).
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying [`Uuid`].
            pub fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed
// ---------------------------------------------------------------------------

uuid_id! {
    /// Identifies one content item for its whole lifetime.
    ///
    /// Assigned when a topic is accepted; also used as the idempotency key
    /// handed to platform publishers.
    ItemId
}

uuid_id! {
    /// Identifies a single executor run (one CLI invocation).
    ///
    /// Propagated through spans and stage contexts so all activity from a
    /// single run can be correlated.
    RunId
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (configuration / remote names)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a stage by its configured name (e.g. `"fact-check"`).
    ///
    /// Stage ids are unique within a pipeline configuration.
    StageId
}

string_id! {
    /// Identifies a destination platform (e.g. `"instagram"`).
    DestinationId
}

string_id! {
    /// Names a rubric dimension (e.g. `"hook"`, `"accuracy"`).
    DimensionName
}

string_id! {
    /// Names a rubric declared in the pipeline configuration.
    RubricName
}

string_id! {
    /// Grouping key over which failures are aggregated for circuit-breaking.
    ///
    /// Derived from the item's safety tier.
    CohortKey
}

impl From<crate::SafetyTier> for CohortKey {
    fn from(tier: crate::SafetyTier) -> Self {
        Self(tier.as_str().to_string())
    }
}

string_id! {
    /// Stable hosted address of an uploaded asset (e.g. a CDN URL).
    AssetAddress
}

string_id! {
    /// Identifier assigned by a destination platform to a live post.
    RemotePostId
}

string_id! {
    /// Human-readable topic label of an item.
    TopicLabel
}
