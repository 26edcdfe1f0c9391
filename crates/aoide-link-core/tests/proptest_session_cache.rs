//! Property-based tests for the session play cache.
//!
//! Validates:
//! 1. Locations and ids stay a bijection under any update/remove sequence
//! 2. The last update of an id wins: id_at and is_id_played follow it
//! 3. Repeating an update reports no change
//! 4. Restarting without a start time never backfills
//! 5. Backfill picks exactly the tracks played within one day before start

use aoide_link_core::session_cache::{PlayCounter, RecentlyPlayed, SessionPlayCache, TrackId};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 17, 20, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Update {
        id: i64,
        location: u8,
        counter: PlayCounter,
    },
    Remove {
        id: i64,
    },
}

fn location_name(location: u8) -> String {
    format!("/music/{location:02}.mp3")
}

// =============================================================================
// Strategies
// =============================================================================

fn arb_counter() -> impl Strategy<Value = PlayCounter> {
    (0_u32..5, prop::option::of(-3_000_i64..3_000), any::<bool>()).prop_map(
        |(times_played, minutes, played)| PlayCounter {
            times_played,
            last_played_at: minutes.map(|m| base_time() + Duration::minutes(m)),
            played,
        },
    )
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0_i64..6, 0_u8..6, arb_counter())
            .prop_map(|(id, location, counter)| Op::Update { id, location, counter }),
        1 => (0_i64..6).prop_map(|id| Op::Remove { id }),
    ]
}

fn arb_history() -> impl Strategy<Value = Vec<RecentlyPlayed>> {
    prop::collection::vec((-4_000_i64..4_000, 1_u32..9), 0..16).prop_map(|plays| {
        plays
            .into_iter()
            .enumerate()
            .map(|(index, (minutes, times_played))| RecentlyPlayed {
                id: TrackId(index as i64),
                location: format!("/history/{index}.flac"),
                play_counter: PlayCounter::played_at(
                    times_played,
                    base_time() + Duration::minutes(minutes),
                ),
            })
            .collect()
    })
}

// =============================================================================
// Properties 1-3: updates
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn locations_and_ids_stay_a_bijection(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut cache = SessionPlayCache::new();
        cache.restart(&Vec::new(), Some(base_time()));
        let mut model_locations: HashMap<String, i64> = HashMap::new();
        let mut model_counters: HashMap<i64, PlayCounter> = HashMap::new();

        for op in ops {
            match op {
                Op::Update { id, location, counter } => {
                    let location = location_name(location);
                    if let Some(previous) = model_locations.get(&location).copied() {
                        if previous != id {
                            model_locations.retain(|_, mapped| *mapped != previous);
                            model_counters.remove(&previous);
                        }
                    }
                    model_locations.retain(|loc, mapped| *mapped != id || *loc == location);
                    model_locations.insert(location.clone(), id);
                    model_counters.insert(id, counter.clone());
                    cache.update(TrackId(id), location, counter);
                }
                Op::Remove { id } => {
                    model_locations.retain(|_, mapped| *mapped != id);
                    model_counters.remove(&id);
                    cache.remove_by_id(TrackId(id));
                }
            }

            prop_assert_eq!(cache.len(), model_counters.len());
            prop_assert_eq!(model_locations.len(), model_counters.len());
            let distinct: HashSet<i64> = model_locations.values().copied().collect();
            prop_assert_eq!(distinct.len(), model_locations.len());
        }

        for location in 0..6 {
            let name = location_name(location);
            let expected = model_locations.get(&name).map(|id| TrackId(*id));
            prop_assert_eq!(cache.id_at(&name), expected);
        }
        for (id, counter) in &model_counters {
            prop_assert_eq!(cache.is_id_played(TrackId(*id)), cache.is_played(counter));
        }
    }

    #[test]
    fn repeated_update_reports_no_change(
        id in 0_i64..100,
        location in 0_u8..10,
        counter in arb_counter(),
    ) {
        let mut cache = SessionPlayCache::new();
        prop_assert!(cache.update(TrackId(id), location_name(location), counter.clone()));
        prop_assert!(!cache.update(TrackId(id), location_name(location), counter));
        prop_assert_eq!(cache.len(), 1);
    }
}

// =============================================================================
// Properties 4-5: restart and backfill
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn restart_without_start_never_backfills(history in arb_history()) {
        let mut cache = SessionPlayCache::new();
        cache.restart(&history, None);
        prop_assert!(cache.is_empty());
        prop_assert_eq!(cache.started_at(), None);
    }

    #[test]
    fn backfill_covers_one_day_before_start(
        history in arb_history(),
        start_offset in -600_i64..600,
    ) {
        let start = base_time() + Duration::minutes(start_offset);
        let mut cache = SessionPlayCache::new();
        cache.restart(&history, Some(start));

        let since = start - Duration::days(1);
        let expected: Vec<&RecentlyPlayed> = history
            .iter()
            .filter(|track| track.play_counter.last_played_at.is_some_and(|at| at >= since))
            .collect();
        prop_assert_eq!(cache.len(), expected.len());
        for track in expected {
            prop_assert_eq!(cache.id_at(&track.location), Some(track.id));
            let played_in_session = track.play_counter.last_played_at.is_some_and(|at| at >= start);
            prop_assert_eq!(cache.is_location_played(&track.location), played_in_session);
        }

        // Moving the start forward keeps what was backfilled
        let later = start + Duration::hours(1);
        cache.restart(&Vec::new(), Some(later));
        prop_assert_eq!(cache.started_at(), Some(later));
    }
}
