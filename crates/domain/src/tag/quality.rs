use serde::{Deserialize, Serialize};

/// Tag value quality indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    /// Value came from a successful poll and is inside the freshness window
    Good,
    /// No update has arrived within the freshness window (derived at read time)
    Stale,
    /// The owning adapter reported a communication failure
    Bad,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Stale => "stale",
            Self::Bad => "bad",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_as_str() {
        assert_eq!(Quality::Good.as_str(), "good");
        assert_eq!(Quality::Stale.as_str(), "stale");
        assert_eq!(Quality::Bad.as_str(), "bad");
    }

    #[test]
    fn test_is_usable() {
        assert!(Quality::Good.is_usable());
        assert!(!Quality::Stale.is_usable());
        assert!(!Quality::Bad.is_usable());
    }
}
