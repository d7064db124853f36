// SPDX-License-Identifier: PMPL-1.0-or-later
//! Flush and roll policy.
//!
//! Pure functions over a translog stats snapshot and a settings snapshot.
//! The shard evaluates them after every write; a flush is checked first
//! because it rolls the generation as part of establishing a new commit.

use verisim_translog::TranslogStats;

use crate::settings::ShardSettings;

/// Maintenance the shard should schedule after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceAction {
    Flush,
    RollGeneration,
}

/// Whether uncommitted translog bytes exceed the flush threshold.
pub fn should_periodically_flush(stats: &TranslogStats, settings: &ShardSettings) -> bool {
    stats.uncommitted_size_in_bytes > settings.flush_threshold_size
}

/// Whether the current generation, header included, exceeds the generation
/// threshold.
pub fn should_roll_generation(current_generation_size: u64, settings: &ShardSettings) -> bool {
    current_generation_size > settings.generation_threshold_size
}

/// Decide what, if anything, to schedule.
pub fn evaluate(
    stats: &TranslogStats,
    current_generation_size: u64,
    settings: &ShardSettings,
) -> Option<MaintenanceAction> {
    if should_periodically_flush(stats, settings) {
        Some(MaintenanceAction::Flush)
    } else if should_roll_generation(current_generation_size, settings) {
        Some(MaintenanceAction::RollGeneration)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn settings(flush: u64, generation: u64) -> ShardSettings {
        ShardSettings {
            flush_threshold_size: flush,
            generation_threshold_size: generation,
            ..ShardSettings::default()
        }
    }

    fn stats(uncommitted: u64) -> TranslogStats {
        TranslogStats {
            uncommitted_size_in_bytes: uncommitted,
            ..TranslogStats::default()
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let settings = settings(100, 100);
        assert!(!should_periodically_flush(&stats(100), &settings));
        assert!(should_periodically_flush(&stats(101), &settings));
        assert!(!should_roll_generation(100, &settings));
        assert!(should_roll_generation(101, &settings));
    }

    #[test]
    fn test_flush_wins_over_roll() {
        let settings = settings(100, 100);
        assert_eq!(
            evaluate(&stats(500), 500, &settings),
            Some(MaintenanceAction::Flush)
        );
        assert_eq!(
            evaluate(&stats(50), 500, &settings),
            Some(MaintenanceAction::RollGeneration)
        );
        assert_eq!(evaluate(&stats(50), 50, &settings), None);
    }

    proptest! {
        #[test]
        fn prop_flush_stays_due_until_reset(
            threshold in 1u64..10_000,
            appends in proptest::collection::vec(1u64..2_000, 1..50),
        ) {
            let settings = settings(threshold, u64::MAX);
            let mut uncommitted = 0u64;
            let mut due = false;
            for size in appends {
                uncommitted += size;
                let now_due = should_periodically_flush(&stats(uncommitted), &settings);
                prop_assert!(!due || now_due);
                due = now_due;
            }
            prop_assert!(!should_periodically_flush(&stats(0), &settings));
        }
    }
}
