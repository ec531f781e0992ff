use serde::Deserialize;

use crate::error::{Error, Result};

/// What to do with a tier outside `0..tiers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTierPolicy {
    /// Refuse the session with `Error::InvalidTier`.
    #[default]
    Reject,
    /// Treat the session as the strictest tier.
    Clamp,
}

/// Priority class of a session.
///
/// Lower values tolerate more congestion. Fixed for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tier(usize);

impl Tier {
    /// Validate a caller-supplied tier against the number of tiers.
    pub fn new(value: i64, tiers: usize, policy: InvalidTierPolicy) -> Result<Self> {
        match usize::try_from(value) {
            Ok(index) if index < tiers => Ok(Tier(index)),
            _ if policy == InvalidTierPolicy::Clamp && tiers > 0 => {
                tracing::debug!("Clamping tier {} to {}", value, tiers - 1);
                Ok(Tier(tiers - 1))
            }
            _ => Err(Error::InvalidTier { tier: value, tiers }),
        }
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// How much occupancy of lower tiers this tier tolerates: `capacity - tier`.
    pub fn headroom(self, capacity: usize) -> usize {
        capacity.saturating_sub(self.0)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tiers() {
        for value in 0..4 {
            let tier = Tier::new(value, 4, InvalidTierPolicy::Reject).unwrap();
            assert_eq!(tier.index(), value as usize);
        }
    }

    #[test]
    fn test_reject_out_of_range() {
        for value in [-1, 4, 100] {
            let result = Tier::new(value, 4, InvalidTierPolicy::Reject);
            assert!(matches!(
                result,
                Err(Error::InvalidTier { tier, tiers: 4 }) if tier == value
            ));
        }
    }

    #[test]
    fn test_clamp_out_of_range() {
        assert_eq!(Tier::new(9, 4, InvalidTierPolicy::Clamp).unwrap().index(), 3);
        assert_eq!(Tier::new(-3, 4, InvalidTierPolicy::Clamp).unwrap().index(), 3);
        assert_eq!(Tier::new(2, 4, InvalidTierPolicy::Clamp).unwrap().index(), 2);
    }

    #[test]
    fn test_clamp_without_tiers_is_rejected() {
        assert!(Tier::new(0, 0, InvalidTierPolicy::Clamp).is_err());
    }

    #[test]
    fn test_headroom() {
        assert_eq!(Tier(0).headroom(4), 4);
        assert_eq!(Tier(3).headroom(4), 1);
        assert_eq!(Tier(5).headroom(4), 0);
    }
}
