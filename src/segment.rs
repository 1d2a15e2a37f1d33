use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Price-paid property type. `All` only appears on roll-up rows and in
/// requests; transactions always carry a concrete type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    #[serde(rename = "D")]
    Detached,
    #[serde(rename = "S")]
    SemiDetached,
    #[serde(rename = "T")]
    Terraced,
    #[serde(rename = "F")]
    Flat,
    #[serde(rename = "O")]
    Other,
    #[serde(rename = "ALL")]
    All,
}

impl PropertyType {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Detached => "D",
            Self::SemiDetached => "S",
            Self::Terraced => "T",
            Self::Flat => "F",
            Self::Other => "O",
            Self::All => "ALL",
        }
    }
}

impl FromStr for PropertyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "D" => Ok(Self::Detached),
            "S" => Ok(Self::SemiDetached),
            "T" => Ok(Self::Terraced),
            "F" => Ok(Self::Flat),
            "O" => Ok(Self::Other),
            "ALL" => Ok(Self::All),
            other => Err(ConfigError::UnknownCategory {
                dimension: "property_type",
                code: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NewBuild {
    #[serde(rename = "Y")]
    Yes,
    #[serde(rename = "N")]
    No,
    #[serde(rename = "ALL")]
    All,
}

impl NewBuild {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Yes => "Y",
            Self::No => "N",
            Self::All => "ALL",
        }
    }
}

impl FromStr for NewBuild {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "Y" => Ok(Self::Yes),
            "N" => Ok(Self::No),
            "ALL" => Ok(Self::All),
            other => Err(ConfigError::UnknownCategory {
                dimension: "new_build",
                code: other.to_owned(),
            }),
        }
    }
}

/// An explicit (property_type, new_build) pair. Rows from different roll-up
/// levels share cells, so every consumer filters by a full segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub property_type: PropertyType,
    pub new_build: NewBuild,
}

impl Segment {
    pub const ALL: Segment = Segment {
        property_type: PropertyType::All,
        new_build: NewBuild::All,
    };

    pub fn new(property_type: PropertyType, new_build: NewBuild) -> Self {
        Self {
            property_type,
            new_build,
        }
    }

    pub fn level(&self) -> RollupLevel {
        match (self.property_type, self.new_build) {
            (PropertyType::All, NewBuild::All) => RollupLevel::AllAll,
            (PropertyType::All, _) => RollupLevel::AllBuild,
            (_, NewBuild::All) => RollupLevel::TypeAll,
            _ => RollupLevel::TypeBuild,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.property_type.code(), self.new_build.code())
    }
}

/// Which categorical dimensions a roll-up keeps at their real values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RollupLevel {
    TypeBuild,
    TypeAll,
    AllBuild,
    AllAll,
}

impl RollupLevel {
    pub const ALL: [RollupLevel; 4] = [
        Self::TypeBuild,
        Self::TypeAll,
        Self::AllBuild,
        Self::AllAll,
    ];

    /// Collapses a transaction's concrete categories to this level's segment.
    pub fn project(&self, property_type: PropertyType, new_build: NewBuild) -> Segment {
        match self {
            Self::TypeBuild => Segment::new(property_type, new_build),
            Self::TypeAll => Segment::new(property_type, NewBuild::All),
            Self::AllBuild => Segment::new(PropertyType::All, new_build),
            Self::AllAll => Segment::ALL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_matches_level() {
        for level in RollupLevel::ALL {
            let seg = level.project(PropertyType::Flat, NewBuild::Yes);
            assert_eq!(seg.level(), level);
        }
    }

    #[test]
    fn parses_codes_case_insensitively() {
        assert_eq!("d".parse::<PropertyType>().unwrap(), PropertyType::Detached);
        assert_eq!("all".parse::<NewBuild>().unwrap(), NewBuild::All);
        assert!("X".parse::<PropertyType>().is_err());
        assert_eq!(Segment::ALL.to_string(), "ALL/ALL");
    }
}
