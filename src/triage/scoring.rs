use crate::config::ScoringConfig;
use crate::patient::EsiLevel;

/// Priority score for ordering patients within the queue.
///
/// Lower ESI always means a higher base weight. Waiting adds points at a
/// fixed rate up to a cap, and age extremes and pain add small bonuses.
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    config: ScoringConfig,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        PriorityScorer { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, esi_level: EsiLevel, wait_minutes: i64, age: u32, pain_level: u8) -> f64 {
        let c = &self.config;

        let base = c.base_weights[esi_level.index()];
        let wait = (wait_minutes.max(0) as f64 * c.wait_points_per_minute).min(c.wait_cap);

        let age_bonus = if age <= c.infant_max_age {
            c.infant_bonus
        } else if age >= c.elderly_min_age {
            c.elderly_bonus
        } else {
            0.0
        };

        let pain = f64::from(pain_level.min(10)) * c.pain_points_per_level;

        round2(base + wait + age_bonus + pain)
    }
}

impl Default for PriorityScorer {
    fn default() -> Self {
        PriorityScorer::new(ScoringConfig::default())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_severe_levels_always_score_higher() {
        let scorer = PriorityScorer::default();
        for wait in [0, 15, 90, 10_000] {
            for age in [0, 30, 90] {
                for pain in [0, 5, 10] {
                    for pair in EsiLevel::ALL.windows(2) {
                        let (severe, milder) = (pair[0], pair[1]);
                        assert!(
                            scorer.score(severe, wait, age, pain) > scorer.score(milder, wait, age, pain),
                            "{severe} vs {milder} at wait={wait} age={age} pain={pain}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn waiting_never_lowers_the_score_and_is_capped() {
        let scorer = PriorityScorer::default();
        let cap = scorer.config().wait_cap;
        let start = scorer.score(EsiLevel::Urgent, 0, 40, 3);

        let mut previous = start;
        for wait in [1, 5, 30, 120, 199, 200, 201, 5_000, i64::MAX / 4] {
            let current = scorer.score(EsiLevel::Urgent, wait, 40, 3);
            assert!(current >= previous);
            assert!(current - start <= cap);
            previous = current;
        }
    }

    #[test]
    fn no_amount_of_waiting_lifts_esi_2_over_esi_1() {
        let scorer = PriorityScorer::default();
        let longest = scorer.score(EsiLevel::Emergent, 1_000_000, 1, 10);
        let fresh = scorer.score(EsiLevel::Resuscitation, 0, 40, 0);
        assert!(fresh > longest);
    }

    #[test]
    fn age_extremes_and_pain_add_small_bonuses() {
        let scorer = PriorityScorer::default();
        let adult = scorer.score(EsiLevel::LessUrgent, 0, 40, 0);
        assert!(scorer.score(EsiLevel::LessUrgent, 0, 1, 0) > adult);
        assert!(scorer.score(EsiLevel::LessUrgent, 0, 80, 0) > adult);
        assert!(scorer.score(EsiLevel::LessUrgent, 0, 40, 6) > adult);
    }

    #[test]
    fn negative_wait_counts_as_zero() {
        let scorer = PriorityScorer::default();
        assert_eq!(
            scorer.score(EsiLevel::Urgent, -30, 40, 0),
            scorer.score(EsiLevel::Urgent, 0, 40, 0)
        );
    }

    #[test]
    fn default_policy_literal_values() {
        let scorer = PriorityScorer::default();
        assert_eq!(scorer.score(EsiLevel::Resuscitation, 0, 40, 0), 1000.0);
        assert_eq!(scorer.score(EsiLevel::Urgent, 30, 70, 4), 228.0);
        assert_eq!(scorer.score(EsiLevel::NonUrgent, 600, 1, 0), 120.0);
    }
}
