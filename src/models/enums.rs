use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::contracts::ContractError;

/// Macro to generate a closed wire enum with as_str + std::str::FromStr.
///
/// Serde goes through the same string table, so an unknown wire value is a
/// decode failure rather than a silently accepted variant.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Wire strings in declaration order.
            pub const VALUES: &'static [&'static str] = &[$($s),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$(Self::$variant),+]
            }
        }

        impl std::str::FromStr for $name {
            type Err = ContractError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(ContractError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

str_enum!(
    /// Pipeline stages in their expected processing order.
    Stage {
        Preprocessing => "preprocessing",
        Chunking => "chunking",
        EntityExtraction => "entity_extraction",
        Standardization => "standardization",
    }
);

str_enum!(
    /// Lifecycle status carried by every message.
    MessageStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

str_enum!(
    /// OMOP clinical domain of an extracted term.
    Domain {
        Drug => "Drug",
        Measurement => "Measurement",
        Procedure => "Procedure",
        Condition => "Condition",
        Observation => "Observation",
        Device => "Device",
        Specimen => "Specimen",
    }
);

str_enum!(
    /// How a term was matched against the standard vocabularies.
    MatchType {
        Direct => "direct",
        Ingredient => "ingredient",
        NoMatch => "no_match",
    }
);

str_enum!(
    /// Revision of the message schemas. `V1` is the strict revision (two
    /// output statuses, at least one extracted term); `V2` is permissive.
    SchemaVersion {
        V1 => "v1",
        V2 => "v2",
    }
);

impl Stage {
    /// Position in the pipeline, starting at zero.
    pub fn index(&self) -> usize {
        match self {
            Self::Preprocessing => 0,
            Self::Chunking => 1,
            Self::EntityExtraction => 2,
            Self::Standardization => 3,
        }
    }

    pub fn previous(&self) -> Option<Stage> {
        match self {
            Self::Preprocessing => None,
            Self::Chunking => Some(Self::Preprocessing),
            Self::EntityExtraction => Some(Self::Chunking),
            Self::Standardization => Some(Self::EntityExtraction),
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Preprocessing => Some(Self::Chunking),
            Self::Chunking => Some(Self::EntityExtraction),
            Self::EntityExtraction => Some(Self::Standardization),
            Self::Standardization => None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.next().is_none()
    }
}

impl MessageStatus {
    /// Completed and failed messages never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lifecycle position. Completed and failed share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Legal single-step transitions: pending -> processing -> {completed | failed}.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}
