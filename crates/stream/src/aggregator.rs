//! The windowing engine.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

use lowtide_core::{Error, EventBus, Result};

use crate::config::{WindowConfig, WindowMode};
use crate::window::{DataWindow, WindowBounds, WindowEvent};

/// Pure function reducing a window's items to one value.
pub type AggregateFn<T, A> = Box<dyn Fn(&[T]) -> A + Send + Sync>;

struct Timed<T> {
    index: u64,
    at: DateTime<Utc>,
    item: T,
}

/// Resolved per-mode parameters.
#[derive(Clone, Copy)]
enum Shape {
    Count { size: usize, slide: usize },
    Trailing(TimeDelta),
    Session(TimeDelta),
}

impl Shape {
    fn from_mode(mode: WindowMode) -> Result<Self> {
        let delta = |d: std::time::Duration| {
            TimeDelta::from_std(d)
                .map_err(|_| Error::configuration("window duration is out of range"))
        };
        Ok(match mode {
            WindowMode::Tumbling { size } => Self::Count { size, slide: size },
            WindowMode::Sliding { size, slide } => Self::Count { size, slide },
            WindowMode::Time { duration } => Self::Trailing(delta(duration)?),
            WindowMode::Session { timeout } => Self::Session(delta(timeout)?),
        })
    }
}

/// Cuts an append-only stream into windows.
///
/// Count-based modes close a window each time `size` items are buffered and
/// then drop `slide` items from the front. Time mode re-cuts the trailing
/// span on every insert but only closes a window when its member count
/// changed. Session mode closes the open session when an item arrives more
/// than `timeout` after the previous one.
pub struct WindowedAggregator<T, A = ()> {
    config: WindowConfig,
    shape: Shape,
    aggregate: Option<AggregateFn<T, A>>,
    buffer: VecDeque<Timed<T>>,
    next_index: u64,
    /// Stream position up to which count-based items already belong to a window.
    covered: u64,
    latest_at: Option<DateTime<Utc>>,
    last_trailing_len: Option<usize>,
    windows: VecDeque<DataWindow<T, A>>,
    next_id: u64,
    events: EventBus<WindowEvent>,
}

impl<T: Clone> WindowedAggregator<T, ()> {
    /// An aggregator that only groups items.
    pub fn new(config: WindowConfig) -> Result<Self> {
        Self::build(config, None)
    }
}

impl<T: Clone, A> WindowedAggregator<T, A> {
    /// An aggregator that also reduces every window with `aggregate`.
    pub fn with_aggregate(
        config: WindowConfig,
        aggregate: impl Fn(&[T]) -> A + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::build(config, Some(Box::new(aggregate)))
    }

    fn build(config: WindowConfig, aggregate: Option<AggregateFn<T, A>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shape: Shape::from_mode(config.mode)?,
            config,
            aggregate,
            buffer: VecDeque::new(),
            next_index: 0,
            covered: 0,
            latest_at: None,
            last_trailing_len: None,
            windows: VecDeque::new(),
            next_id: 1,
            events: EventBus::default(),
        })
    }

    /// Aggregator configuration.
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Subscribe to window events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WindowEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------

    /// Append an item stamped now. Returns the id of a window it closed.
    pub fn push(&mut self, item: T) -> Option<u64> {
        self.push_at(item, Utc::now())
    }

    /// Append an item with an explicit timestamp.
    pub fn push_at(&mut self, item: T, at: DateTime<Utc>) -> Option<u64> {
        let index = self.next_index;
        self.next_index += 1;

        match self.shape {
            Shape::Count { size, slide } => {
                self.buffer.push_back(Timed { index, at, item });
                if self.buffer.len() < size {
                    return None;
                }
                let start = self.buffer.front().map_or(index, |t| t.index);
                let items: Vec<T> = self.buffer.iter().take(size).map(|t| t.item.clone()).collect();
                self.covered = start + size as u64;
                self.buffer.drain(..slide.min(self.buffer.len()));
                Some(self.close(
                    WindowBounds::Index {
                        start,
                        end: start + size as u64,
                    },
                    items,
                ))
            }
            Shape::Trailing(span) => {
                let latest = self.latest_at.map_or(at, |l| l.max(at));
                self.latest_at = Some(latest);
                self.buffer.push_back(Timed { index, at, item });
                let cutoff = latest
                    .checked_sub_signed(span)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                self.buffer.retain(|t| t.at >= cutoff);

                let len = self.buffer.len();
                if self.last_trailing_len == Some(len) {
                    return None;
                }
                self.last_trailing_len = Some(len);
                let bounds = self.time_bounds();
                let items = self.buffer.iter().map(|t| t.item.clone()).collect();
                Some(self.close(bounds, items))
            }
            Shape::Session(timeout) => {
                let closed = match self.latest_at {
                    Some(last) if at - last > timeout => self.close_session(),
                    _ => None,
                };
                self.latest_at = Some(self.latest_at.map_or(at, |l| l.max(at)));
                self.buffer.push_back(Timed { index, at, item });
                closed
            }
        }
    }

    /// Push every item, stamped now. Returns the ids of closed windows.
    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) -> Vec<u64> {
        items.into_iter().filter_map(|item| self.push(item)).collect()
    }

    /// Close whatever is open: a partial count window or the current session.
    /// Time mode has nothing open and returns `None`.
    pub fn flush(&mut self) -> Option<u64> {
        match self.shape {
            Shape::Count { .. } => {
                let fresh = self.buffer.back().is_some_and(|t| t.index >= self.covered);
                if !fresh {
                    return None;
                }
                let start = self.buffer.front().map_or(0, |t| t.index);
                let end = self.next_index;
                let items = self.buffer.drain(..).map(|t| t.item).collect();
                self.covered = end;
                Some(self.close(WindowBounds::Index { start, end }, items))
            }
            Shape::Trailing(_) => None,
            Shape::Session(_) => self.close_session(),
        }
    }

    /// Close the open session if nothing arrived for longer than the timeout
    /// before `now`.
    pub fn close_idle_sessions(&mut self, now: DateTime<Utc>) -> Option<u64> {
        match (self.shape, self.latest_at) {
            (Shape::Session(timeout), Some(last)) if now - last > timeout => self.close_session(),
            _ => None,
        }
    }

    fn close_session(&mut self) -> Option<u64> {
        if self.buffer.is_empty() {
            return None;
        }
        let bounds = self.time_bounds();
        let items = self.buffer.drain(..).map(|t| t.item).collect();
        Some(self.close(bounds, items))
    }

    fn time_bounds(&self) -> WindowBounds {
        let start = self.buffer.iter().map(|t| t.at).min();
        let end = self.buffer.iter().map(|t| t.at).max();
        match (start, end) {
            (Some(start), Some(end)) => WindowBounds::Time { start, end },
            _ => WindowBounds::Index {
                start: self.next_index,
                end: self.next_index,
            },
        }
    }

    fn close(&mut self, bounds: WindowBounds, items: Vec<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let aggregate = self.aggregate.as_ref().map(|f| f(&items));
        let len = items.len();

        self.windows.push_back(DataWindow {
            id,
            bounds,
            items,
            aggregate,
        });
        tracing::trace!(window_id = id, len, "window created");
        self.events.emit(WindowEvent::Created { id, len, bounds });

        while self.windows.len() > self.config.max_windows {
            if let Some(old) = self.windows.pop_front() {
                tracing::trace!(window_id = old.id, "window removed");
                self.events.emit(WindowEvent::Removed { id: old.id });
            }
        }
        id
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Stored windows, oldest first.
    pub fn windows(&self) -> impl ExactSizeIterator<Item = &DataWindow<T, A>> {
        self.windows.iter()
    }

    /// Most recently closed window.
    pub fn latest(&self) -> Option<&DataWindow<T, A>> {
        self.windows.back()
    }

    /// Window by id, if still stored.
    pub fn window(&self, id: u64) -> Option<&DataWindow<T, A>> {
        self.windows
            .binary_search_by_key(&id, |w| w.id)
            .ok()
            .and_then(|i| self.windows.get(i))
    }

    /// Items buffered but not yet in a closed window.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all windows and buffered items. Ids keep increasing.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.windows.clear();
        self.covered = self.next_index;
        self.latest_at = None;
        self.last_trailing_len = None;
    }
}

impl<T, A> fmt::Debug for WindowedAggregator<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowedAggregator")
            .field("mode", &self.config.mode)
            .field("buffered", &self.buffer.len())
            .field("windows", &self.windows.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn members<T: Clone, A>(agg: &WindowedAggregator<T, A>) -> Vec<Vec<T>> {
        agg.windows().map(|w| w.items.clone()).collect()
    }

    #[test]
    fn tumbling_windows_do_not_overlap() {
        let mut agg =
            WindowedAggregator::with_aggregate(WindowConfig::tumbling(3), |xs: &[i32]| {
                xs.iter().sum::<i32>()
            })
            .unwrap();
        let closed = agg.extend(1..=7);

        assert_eq!(closed, vec![1, 2]);
        assert_eq!(members(&agg), vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(agg.latest().and_then(|w| w.aggregate), Some(15));
        assert_eq!(agg.buffered(), 1);

        assert_eq!(agg.flush(), Some(3));
        assert_eq!(agg.latest().map(|w| w.items.clone()), Some(vec![7]));
        assert_eq!(agg.flush(), None);
    }

    #[test]
    fn sliding_windows_overlap() {
        let mut agg = WindowedAggregator::new(WindowConfig::sliding(4, 2)).unwrap();
        agg.extend(1..=8);

        assert_eq!(
            members(&agg),
            vec![vec![1, 2, 3, 4], vec![3, 4, 5, 6], vec![5, 6, 7, 8]]
        );
        assert_eq!(
            agg.window(2).map(|w| w.bounds),
            Some(WindowBounds::Index { start: 2, end: 6 })
        );
        // 7 and 8 are already covered
        assert_eq!(agg.flush(), None);
    }

    #[test]
    fn trailing_window_emits_only_on_count_change() {
        let mut agg = WindowedAggregator::new(WindowConfig::time(Duration::from_secs(10))).unwrap();

        assert_eq!(agg.push_at('a', t(0)), Some(1));
        assert_eq!(agg.push_at('b', t(5)), Some(2));
        // 'a' falls out as 'c' comes in: still two members
        assert_eq!(agg.push_at('c', t(12)), None);
        assert_eq!(agg.push_at('d', t(13)), Some(3));

        assert_eq!(members(&agg).last(), Some(&vec!['b', 'c', 'd']));
        assert_eq!(
            agg.latest().map(|w| w.bounds),
            Some(WindowBounds::Time { start: t(5), end: t(13) })
        );
    }

    #[test]
    fn trailing_span_wider_than_the_calendar_keeps_everything() {
        let mut agg = WindowedAggregator::new(WindowConfig::time(Duration::from_secs(
            10_000_000_000_000,
        )))
        .unwrap();

        assert_eq!(agg.push(1), Some(1));
        assert_eq!(agg.push_at(2, t(0)), Some(2));
        assert_eq!(members(&agg).last(), Some(&vec![1, 2]));
    }

    #[test]
    fn session_closes_on_gap() {
        let mut agg =
            WindowedAggregator::new(WindowConfig::session(Duration::from_secs(30))).unwrap();

        assert_eq!(agg.push_at(1, t(0)), None);
        assert_eq!(agg.push_at(2, t(20)), None);
        assert_eq!(agg.push_at(3, t(45)), None);
        assert_eq!(agg.push_at(4, t(100)), Some(1));
        assert_eq!(members(&agg), vec![vec![1, 2, 3]]);

        assert_eq!(agg.close_idle_sessions(t(120)), None);
        assert_eq!(agg.close_idle_sessions(t(131)), Some(2));
        assert_eq!(members(&agg), vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(agg.flush(), None);
    }

    #[test]
    fn oldest_windows_are_evicted() {
        let config = WindowConfig::tumbling(1).with_max_windows(3);
        let mut agg = WindowedAggregator::new(config).unwrap();
        let mut rx = agg.subscribe();
        agg.extend(0..5);

        let ids: Vec<u64> = agg.windows().map(|w| w.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(agg.window(1).is_none());

        let mut removed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WindowEvent::Removed { id } = event {
                removed.push(id);
            }
        }
        assert_eq!(removed, vec![1, 2]);
    }

    #[test]
    fn clear_keeps_ids_increasing() {
        let mut agg = WindowedAggregator::new(WindowConfig::tumbling(2)).unwrap();
        agg.extend([1, 2, 3]);
        agg.clear();
        assert_eq!(agg.buffered(), 0);
        assert_eq!(agg.windows().len(), 0);

        agg.extend([4, 5]);
        assert_eq!(agg.latest().map(|w| w.id), Some(2));
    }
}
