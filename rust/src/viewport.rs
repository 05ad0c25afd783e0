//! Visible-window math for long feeds.
//!
//! `compute_visible` is the pure fixed-height form. `ViewportIndexer` keeps a
//! prefix table of item tops so measured heights work and a tail append only
//! costs the new rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message_log::LogChange;

pub const DEFAULT_ESTIMATED_ITEM_HEIGHT: f64 = 56.0;
pub const DEFAULT_OVERSCAN: u32 = 8;

/// Contiguous range of rows to materialize. `end_index` is inclusive and
/// `offsets[i]` is the top of row `start_index + i`. Empty when the feed is.
#[derive(uniffi::Record, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisibleWindow {
    pub start_index: u32,
    pub end_index: u32,
    pub offsets: Vec<f64>,
    pub total_height: f64,
}

impl VisibleWindow {
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        !self.is_empty() && index >= self.start_index as usize && index <= self.end_index as usize
    }
}

fn sanitize_height(height: f64) -> f64 {
    if height.is_finite() && height > 0.0 {
        height
    } else {
        DEFAULT_ESTIMATED_ITEM_HEIGHT
    }
}

fn sanitize_viewport(viewport_height: f64) -> f64 {
    if viewport_height.is_finite() {
        viewport_height.max(0.0)
    } else {
        0.0
    }
}

fn clamp_offset(scroll_offset: f64, total_height: f64, viewport_height: f64) -> f64 {
    let max_offset = (total_height - viewport_height).max(0.0);
    if scroll_offset.is_nan() {
        0.0
    } else {
        scroll_offset.clamp(0.0, max_offset)
    }
}

pub fn compute_visible(
    total_count: u32,
    scroll_offset: f64,
    viewport_height: f64,
    estimated_item_height: f64,
    overscan: u32,
) -> VisibleWindow {
    let total = total_count as usize;
    if total == 0 {
        return VisibleWindow::default();
    }
    let h = sanitize_height(estimated_item_height);
    let vh = sanitize_viewport(viewport_height);
    let total_height = total as f64 * h;
    let offset = clamp_offset(scroll_offset, total_height, vh);

    let first = ((offset / h).floor() as usize).min(total - 1);
    let last = if vh > 0.0 {
        (((offset + vh) / h).ceil() as usize)
            .saturating_sub(1)
            .clamp(first, total - 1)
    } else {
        first
    };
    let start = first.saturating_sub(overscan as usize);
    let end = last.saturating_add(overscan as usize).min(total - 1);

    VisibleWindow {
        start_index: start as u32,
        end_index: end as u32,
        offsets: (start..=end).map(|i| i as f64 * h).collect(),
        total_height,
    }
}

#[derive(Debug, Clone)]
pub struct ViewportIndexer {
    estimated_item_height: f64,
    overscan: u32,
    measured: HashMap<usize, f64>,
    // tops[i] is the top of row i; the last element is the bottom of the last
    // row covered so far. Never empty.
    tops: Vec<f64>,
}

impl Default for ViewportIndexer {
    fn default() -> Self {
        Self::new(DEFAULT_ESTIMATED_ITEM_HEIGHT, DEFAULT_OVERSCAN)
    }
}

impl ViewportIndexer {
    pub fn new(estimated_item_height: f64, overscan: u32) -> Self {
        Self {
            estimated_item_height: sanitize_height(estimated_item_height),
            overscan,
            measured: HashMap::new(),
            tops: vec![0.0],
        }
    }

    /// Number of rows whose offsets are currently cached.
    pub fn cached_len(&self) -> usize {
        self.tops.len() - 1
    }

    fn height(&self, index: usize) -> f64 {
        self.measured
            .get(&index)
            .copied()
            .unwrap_or(self.estimated_item_height)
    }

    /// Extends the table to cover `count` rows, computing only the missing part.
    fn ensure(&mut self, count: usize) {
        self.tops.reserve(count.saturating_sub(self.cached_len()));
        while self.cached_len() < count {
            let i = self.cached_len();
            let next = self.tops[i] + self.height(i);
            self.tops.push(next);
        }
    }

    /// Keeps the tops of rows `0..=index` (those never depend on row `index`).
    fn invalidate_after(&mut self, index: usize) {
        self.tops.truncate(index + 1);
    }

    pub fn apply(&mut self, change: LogChange) {
        match change {
            LogChange::Unchanged | LogChange::InPlace { .. } => {}
            LogChange::Appended { from } => self.invalidate_after(from),
            LogChange::Reordered { from } => {
                self.invalidate_after(from);
                self.measured.retain(|index, _| *index < from);
            }
        }
    }

    /// Records the rendered height of one row. Offsets below it are recomputed
    /// lazily; rows above keep their cached tops.
    pub fn set_item_height(&mut self, index: usize, height: f64) {
        if !height.is_finite() || height < 0.0 {
            tracing::debug!(index, height, "ignoring invalid measured height");
            return;
        }
        if self.measured.get(&index) == Some(&height) {
            return;
        }
        self.measured.insert(index, height);
        self.invalidate_after(index);
    }

    pub fn total_height(&mut self, total_count: usize) -> f64 {
        self.ensure(total_count);
        self.tops[total_count]
    }

    /// Scroll offset that shows the last row at the bottom of the viewport.
    pub fn tail_offset(&mut self, total_count: usize, viewport_height: f64) -> f64 {
        (self.total_height(total_count) - sanitize_viewport(viewport_height)).max(0.0)
    }

    pub fn compute_visible(
        &mut self,
        total_count: usize,
        scroll_offset: f64,
        viewport_height: f64,
    ) -> VisibleWindow {
        if total_count == 0 {
            return VisibleWindow::default();
        }
        self.ensure(total_count);
        let total_height = self.tops[total_count];
        let vh = sanitize_viewport(viewport_height);
        let offset = clamp_offset(scroll_offset, total_height, vh);

        // First row whose bottom is below the offset.
        let first = self.tops[1..=total_count]
            .partition_point(|bottom| *bottom <= offset)
            .min(total_count - 1);
        let last = if vh > 0.0 {
            let bottom = offset + vh;
            self.tops[..total_count]
                .partition_point(|top| *top < bottom)
                .saturating_sub(1)
                .clamp(first, total_count - 1)
        } else {
            first
        };
        let start = first.saturating_sub(self.overscan as usize);
        let end = last
            .saturating_add(self.overscan as usize)
            .min(total_count - 1);

        VisibleWindow {
            start_index: start as u32,
            end_index: end as u32,
            offsets: self.tops[start..=end].to_vec(),
            total_height,
        }
    }
}
