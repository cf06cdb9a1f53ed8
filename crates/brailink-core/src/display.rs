//! Differential display updates.
//!
//! The writer keeps the cells last sent to the display and works out which
//! part of a new window actually has to go over the link. Nothing is sent
//! when the window is unchanged, unless a rewrite was requested or the
//! periodic full refresh is due.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// The smallest range `[from, to)` outside of which `previous` and `next`
/// already agree. `None` when they are identical.
pub fn changed_range(previous: &[u8], next: &[u8]) -> Option<Range<usize>> {
    let count = previous.len().min(next.len());
    let to = (0..count).rev().find(|&i| previous[i] != next[i])? + 1;
    let from = (0..to).find(|&i| previous[i] != next[i]).unwrap_or(0);
    Some(from..to)
}

/// Runs of changed cells. Unchanged gaps of at most `max_gap` cells are
/// merged into the surrounding ranges; `single_packet` merges everything
/// into one range.
pub fn update_ranges(
    previous: &[u8],
    next: &[u8],
    max_gap: usize,
    single_packet: bool,
) -> Vec<Range<usize>> {
    if single_packet {
        return changed_range(previous, next).into_iter().collect();
    }

    let count = previous.len().min(next.len());
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for index in (0..count).filter(|&i| previous[i] != next[i]) {
        match ranges.last_mut() {
            Some(last) if index - last.end <= max_gap => last.end = index + 1,
            _ => ranges.push(index..index + 1),
        }
    }
    ranges
}

/// When the whole window is rewritten regardless of changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshenPolicy {
    #[default]
    Never,
    /// Every nth write, starting with the first.
    Every(u32),
}

#[derive(Debug, Clone)]
pub struct DisplayWriter {
    previous: Vec<u8>,
    force: bool,
    freshen: FreshenPolicy,
    countdown: u32,
}

impl DisplayWriter {
    /// A writer for `cells` cells. The first write is always complete.
    pub fn new(cells: usize) -> Self {
        Self {
            previous: vec![0; cells],
            force: true,
            freshen: FreshenPolicy::Never,
            countdown: 0,
        }
    }

    pub fn with_freshen(mut self, policy: FreshenPolicy) -> Self {
        self.freshen = policy;
        self
    }

    pub fn cells(&self) -> usize {
        self.previous.len()
    }

    /// What the display is believed to show.
    pub fn previous(&self) -> &[u8] {
        &self.previous
    }

    /// Force the next write to send everything.
    pub fn mark_for_rewrite(&mut self) {
        self.force = true;
    }

    fn full_write_due(&mut self) -> bool {
        let freshen = match self.freshen {
            FreshenPolicy::Never => false,
            FreshenPolicy::Every(period) => {
                if self.countdown <= 1 {
                    self.countdown = period.max(1);
                    true
                } else {
                    self.countdown -= 1;
                    false
                }
            }
        };
        std::mem::take(&mut self.force) || freshen
    }

    /// The single range to send for `next`, if any.
    pub fn plan(&mut self, next: &[u8]) -> Option<Range<usize>> {
        if self.full_write_due() {
            return Some(0..self.cells());
        }
        changed_range(&self.previous, next)
    }

    /// The ranges to send for `next`, see [`update_ranges`].
    pub fn plan_ranges(
        &mut self,
        next: &[u8],
        max_gap: usize,
        single_packet: bool,
    ) -> Vec<Range<usize>> {
        if self.full_write_due() {
            return vec![0..self.cells()];
        }
        update_ranges(&self.previous, next, max_gap, single_packet)
    }

    /// Record that `range` of `next` reached the display.
    pub fn commit(&mut self, next: &[u8], range: Range<usize>) {
        let end = range.end.min(self.previous.len()).min(next.len());
        let start = range.start.min(end);
        self.previous[start..end].copy_from_slice(&next[start..end]);
    }
}
