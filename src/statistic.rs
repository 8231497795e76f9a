use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use crate::frame::Frame;

/// Sliding-window frequency count of procedure names.
///
/// Holds the last `width` ticks worth of frames; pushing a tick beyond that
/// retires the oldest one and its contribution to the counts. `counts` is
/// always the exact sum over the retained ticks.
pub struct RunningStatistic {
    ticks: VecDeque<Vec<Frame>>,
    counts: BTreeMap<String, usize>,
    width: usize,
}

impl RunningStatistic {
    pub fn new(width: usize) -> RunningStatistic {
        RunningStatistic {
            ticks: VecDeque::with_capacity(width),
            counts: BTreeMap::new(),
            width,
        }
    }

    pub fn push_frames(&mut self, frames: Vec<Frame>) {
        if self.ticks.len() == self.width {
            if let Some(retired) = self.ticks.pop_front() {
                for frame in &retired {
                    if let Some(count) = self.counts.get_mut(&frame.proc_name) {
                        *count -= 1;
                        if *count == 0 {
                            self.counts.remove(&frame.proc_name);
                        }
                    }
                }
            }
        }
        for frame in &frames {
            *self.counts.entry(frame.proc_name.clone()).or_insert(0) += 1;
        }
        self.ticks.push_back(frames);
    }

    /// Hottest `count` names as `(hits per retained tick, name)`, hottest
    /// first; the whole `(ratio, name)` pair sorts descending, so equal
    /// ratios order by name in reverse and the table is stable.
    pub fn top_frames(&self, count: usize) -> Vec<(f64, String)> {
        let denominator = self.width.min(self.ticks.len()) as f64;
        let mut top: Vec<(f64, String)> = self
            .counts
            .iter()
            .map(|(name, hits)| (*hits as f64 / denominator, name.clone()))
            .collect();
        top.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        top.truncate(count);
        top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(names: &[&str]) -> Vec<Frame> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Frame {
                ip: i as u64,
                sp: 0,
                proc_name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn counts_are_the_sum_over_the_window() {
        let mut stat = RunningStatistic::new(2);
        stat.push_frames(tick(&["a", "b"]));
        stat.push_frames(tick(&["a"]));
        let top = stat.top_frames(10);
        assert_eq!(top, vec![(1.0, "a".to_string()), (0.5, "b".to_string())]);
    }

    #[test]
    fn old_ticks_retire_with_their_counts() {
        let mut stat = RunningStatistic::new(2);
        stat.push_frames(tick(&["a", "b"]));
        stat.push_frames(tick(&["a"]));
        stat.push_frames(tick(&["c"]));
        // the ["a", "b"] tick fell off the ring
        let top = stat.top_frames(10);
        assert_eq!(top, vec![(0.5, "c".to_string()), (0.5, "a".to_string())]);
    }

    #[test]
    fn retired_names_vanish_entirely() {
        let mut stat = RunningStatistic::new(1);
        stat.push_frames(tick(&["a"]));
        stat.push_frames(tick(&["b"]));
        assert_eq!(stat.top_frames(10), vec![(1.0, "b".to_string())]);
    }

    #[test]
    fn pushing_empty_ticks_drains_the_window() {
        let mut stat = RunningStatistic::new(3);
        stat.push_frames(tick(&["a"]));
        for _ in 0..3 {
            stat.push_frames(Vec::new());
        }
        assert!(stat.top_frames(10).is_empty());
    }

    #[test]
    fn ties_break_by_name_in_reverse() {
        let mut stat = RunningStatistic::new(4);
        stat.push_frames(tick(&["zeta", "alpha", "mid"]));
        stat.push_frames(tick(&["mid"]));
        let top = stat.top_frames(10);
        assert_eq!(top[0].1, "mid");
        assert_eq!(top[1], (0.5, "zeta".to_string()));
        assert_eq!(top[2], (0.5, "alpha".to_string()));
    }

    #[test]
    fn top_truncates() {
        let mut stat = RunningStatistic::new(1);
        stat.push_frames(tick(&["a", "b", "c", "d"]));
        assert_eq!(stat.top_frames(2).len(), 2);
    }

    #[test]
    fn denominator_is_ticks_seen_until_the_window_fills() {
        let mut stat = RunningStatistic::new(100);
        stat.push_frames(tick(&["a"]));
        stat.push_frames(tick(&["a"]));
        assert_eq!(stat.top_frames(1), vec![(1.0, "a".to_string())]);
    }
}
