use super::super::domain::StipendTier;

/// Share of the monthly target, in percent, that earns the full stipend.
pub const FULL_THRESHOLD_PCT: u64 = 85;
/// Share of the monthly target, in percent, below which no stipend is paid.
pub const PRORATA_THRESHOLD_PCT: u64 = 50;

/// Tier banding against a configurable monthly minute target. The default
/// target is 160 hours. Comparisons cross-multiply in integers so a month
/// one minute short of a band never rounds its way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StipendPolicy {
    pub monthly_target_minutes: u64,
}

impl Default for StipendPolicy {
    fn default() -> Self {
        Self {
            monthly_target_minutes: 160 * 60,
        }
    }
}

impl StipendPolicy {
    pub fn new(monthly_target_minutes: u64) -> Self {
        Self {
            monthly_target_minutes: monthly_target_minutes.max(1),
        }
    }

    pub fn classify(&self, total_minutes: u64) -> StipendTier {
        let scaled = u128::from(total_minutes) * 100;
        let target = u128::from(self.monthly_target_minutes);
        if scaled >= u128::from(FULL_THRESHOLD_PCT) * target {
            StipendTier::Full
        } else if scaled >= u128::from(PRORATA_THRESHOLD_PCT) * target {
            StipendTier::Prorata
        } else {
            StipendTier::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_inclusive_at_the_lower_edge() {
        let policy = StipendPolicy::default();
        // 85% of 9600 minutes is exactly 8160.
        assert_eq!(policy.classify(8_160), StipendTier::Full);
        assert_eq!(policy.classify(8_159), StipendTier::Prorata);
        // 50% of 9600 minutes is exactly 4800.
        assert_eq!(policy.classify(4_800), StipendTier::Prorata);
        assert_eq!(policy.classify(4_799), StipendTier::None);
    }

    #[test]
    fn reference_scenarios_classify_as_published() {
        let policy = StipendPolicy::default();
        assert_eq!(policy.classify(136 * 60), StipendTier::Full);
        assert_eq!(policy.classify(90 * 60), StipendTier::Prorata);
        assert_eq!(policy.classify(70 * 60), StipendTier::None);
    }

    #[test]
    fn zero_minutes_is_never_paid() {
        assert_eq!(StipendPolicy::default().classify(0), StipendTier::None);
    }

    #[test]
    fn custom_target_scales_the_bands() {
        let policy = StipendPolicy::new(1_000);
        assert_eq!(policy.classify(850), StipendTier::Full);
        assert_eq!(policy.classify(849), StipendTier::Prorata);
        assert_eq!(policy.classify(500), StipendTier::Prorata);
        assert_eq!(policy.classify(499), StipendTier::None);
    }

    #[test]
    fn degenerate_target_floors_at_one_minute() {
        let policy = StipendPolicy::new(0);
        assert_eq!(policy.monthly_target_minutes, 1);
        assert_eq!(policy.classify(1), StipendTier::Full);
    }
}
