//! Image-safety classification results.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Ordinal likelihood scale used by the safe-search classifier.
///
/// Ordering follows the discriminants, so thresholds compare with `>=`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Likelihood {
    Unknown = 0,
    VeryUnlikely = 1,
    Unlikely = 2,
    Possible = 3,
    Likely = 4,
    VeryLikely = 5,
}

impl Likelihood {
    pub fn from_ordinal(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Unknown,
            1 => Self::VeryUnlikely,
            2 => Self::Unlikely,
            3 => Self::Possible,
            4 => Self::Likely,
            5 => Self::VeryLikely,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::VeryUnlikely => "VERY_UNLIKELY",
            Self::Unlikely => "UNLIKELY",
            Self::Possible => "POSSIBLE",
            Self::Likely => "LIKELY",
            Self::VeryLikely => "VERY_LIKELY",
        }
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts wire names in any case (`likely`, `VERY_LIKELY`, `very-likely`)
/// or the ordinal (`0`..`5`).
impl FromStr for Likelihood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ordinal) = s.parse::<u8>() {
            return Self::from_ordinal(ordinal)
                .ok_or_else(|| format!("likelihood ordinal `{s}` out of range 0..=5"));
        }
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "UNKNOWN" => Ok(Self::Unknown),
            "VERY_UNLIKELY" => Ok(Self::VeryUnlikely),
            "UNLIKELY" => Ok(Self::Unlikely),
            "POSSIBLE" => Ok(Self::Possible),
            "LIKELY" => Ok(Self::Likely),
            "VERY_LIKELY" => Ok(Self::VeryLikely),
            _ => Err(format!("unknown likelihood `{s}`")),
        }
    }
}

/// Reduced safe-search verdict for one image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    pub adult: Likelihood,
    pub violence: Likelihood,
}
