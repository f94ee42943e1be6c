//! Window cutting across modes

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use lowtide_core::Signal;
use lowtide_stream::{WindowBounds, WindowConfig, WindowEvent, WindowedAggregator};

fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000 + millis).unwrap()
}

#[test]
fn tumbling_counts_per_window() {
    let mut agg =
        WindowedAggregator::with_aggregate(WindowConfig::tumbling(4), |xs: &[u32]| xs.len())
            .unwrap();
    let ids = agg.extend(0..10);

    assert_eq!(ids, vec![1, 2]);
    let bounds: Vec<WindowBounds> = agg.windows().map(|w| w.bounds).collect();
    assert_eq!(
        bounds,
        vec![
            WindowBounds::Index { start: 0, end: 4 },
            WindowBounds::Index { start: 4, end: 8 },
        ]
    );

    let id = agg.flush().unwrap();
    let tail = agg.window(id).unwrap();
    assert_eq!(tail.items, vec![8, 9]);
    assert_eq!(tail.aggregate, Some(2));
    assert_eq!(tail.bounds, WindowBounds::Index { start: 8, end: 10 });
}

#[test]
fn sliding_flush_emits_only_uncovered_tail() {
    let mut agg = WindowedAggregator::new(WindowConfig::sliding(3, 2)).unwrap();
    agg.extend(1..=6);

    let members: Vec<Vec<i32>> = agg.windows().map(|w| w.items.clone()).collect();
    assert_eq!(members, vec![vec![1, 2, 3], vec![3, 4, 5]]);

    // 6 is not in any window yet
    let id = agg.flush().unwrap();
    assert_eq!(agg.window(id).unwrap().items, vec![5, 6]);
    assert_eq!(agg.flush(), None);
}

#[test]
fn trailing_time_window_tracks_latest_timestamp() {
    let config = WindowConfig::time(Duration::from_secs(1));
    let mut agg =
        WindowedAggregator::with_aggregate(config, |xs: &[i32]| xs.iter().copied().max()).unwrap();

    assert_eq!(agg.push_at(5, at(0)), Some(1));
    assert_eq!(agg.push_at(9, at(400)), Some(2));
    // 5 ages out as 1 arrives: same member count, no new window
    assert_eq!(agg.push_at(1, at(1_300)), None);
    assert_eq!(agg.push_at(3, at(1_350)), Some(3));
    // late item older than the cutoff is dropped immediately
    assert_eq!(agg.push_at(7, at(100)), None);

    let latest = agg.latest().unwrap();
    assert_eq!(latest.items, vec![9, 1, 3]);
    assert_eq!(latest.aggregate, Some(Some(9)));
    assert_eq!(
        latest.bounds,
        WindowBounds::Time {
            start: at(400),
            end: at(1_350)
        }
    );
}

#[test]
fn sessions_split_on_idle_gaps() {
    let gap = Duration::from_secs(60);
    let mut agg = WindowedAggregator::new(WindowConfig::session(gap)).unwrap();
    let mut rx = agg.subscribe();

    for offset in [0, 30_000, 70_000] {
        assert_eq!(agg.push_at("tap", at(offset)), None);
    }
    assert_eq!(agg.push_at("scroll", at(200_000)), Some(1));
    assert_eq!(agg.flush(), Some(2));

    let windows: Vec<(usize, WindowBounds)> = agg.windows().map(|w| (w.len(), w.bounds)).collect();
    assert_eq!(
        windows,
        vec![
            (
                3,
                WindowBounds::Time {
                    start: at(0),
                    end: at(70_000)
                }
            ),
            (
                1,
                WindowBounds::Time {
                    start: at(200_000),
                    end: at(200_000)
                }
            ),
        ]
    );

    let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|e| e.name())
        .collect();
    assert_eq!(names, vec!["window-created", "window-created"]);
}

#[test]
fn idle_session_closes_after_timeout() {
    let mut agg = WindowedAggregator::new(WindowConfig::session(Duration::from_secs(5))).unwrap();
    agg.push_at(1, at(0));
    agg.push_at(2, at(4_000));

    assert_eq!(agg.close_idle_sessions(at(9_000)), None);
    assert_eq!(agg.close_idle_sessions(at(9_001)), Some(1));
    assert_eq!(agg.close_idle_sessions(at(20_000)), None);
    assert_eq!(agg.buffered(), 0);
}

#[test]
fn max_windows_drops_the_oldest() {
    let mut agg =
        WindowedAggregator::new(WindowConfig::tumbling(2).with_max_windows(2)).unwrap();
    let mut rx = agg.subscribe();
    agg.extend(0..8);

    assert_eq!(agg.windows().map(|w| w.id).collect::<Vec<_>>(), vec![3, 4]);
    let removed: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            WindowEvent::Removed { id } => Some(id),
            WindowEvent::Created { .. } => None,
        })
        .collect();
    assert_eq!(removed, vec![1, 2]);
}

#[test]
fn invalid_configs_are_rejected() {
    assert!(WindowedAggregator::<u8>::new(WindowConfig::tumbling(0)).is_err());
    assert!(WindowedAggregator::<u8>::new(WindowConfig::sliding(2, 3)).is_err());
    assert!(WindowedAggregator::<u8>::new(WindowConfig::time(Duration::ZERO)).is_err());
    assert!(WindowedAggregator::<u8>::new(WindowConfig::session(Duration::MAX)).is_err());
}

proptest! {
    #[test]
    fn tumbling_windows_partition_the_stream(size in 1usize..8, n in 0u64..60) {
        let config = WindowConfig::tumbling(size).with_max_windows(1_000);
        let mut agg = WindowedAggregator::new(config).unwrap();
        agg.extend(0..n);
        agg.flush();

        let seen: Vec<u64> = agg.windows().flat_map(|w| w.items.iter().copied()).collect();
        prop_assert_eq!(seen, (0..n).collect::<Vec<_>>());
        prop_assert!(agg.windows().all(|w| w.len() <= size && !w.is_empty()));
    }

    #[test]
    fn stored_windows_stay_bounded(max in 1usize..10, slide in 1usize..4, n in 0u32..100) {
        let config = WindowConfig::sliding(4, slide).with_max_windows(max);
        let mut agg = WindowedAggregator::new(config).unwrap();
        for i in 0..n {
            agg.push(i);
            prop_assert!(agg.windows().len() <= max);
        }
    }

    #[test]
    fn trailing_window_spans_at_most_the_duration(
        gaps in proptest::collection::vec(0i64..500, 1..40),
    ) {
        let span = Duration::from_millis(1_000);
        let mut agg = WindowedAggregator::new(WindowConfig::time(span)).unwrap();
        let mut t = 0;
        for gap in gaps {
            t += gap;
            agg.push_at(t, at(t));
        }
        for w in agg.windows() {
            if let WindowBounds::Time { start, end } = w.bounds {
                prop_assert!(end - start <= TimeDelta::milliseconds(1_000));
            }
        }
    }
}
