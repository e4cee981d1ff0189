//! Bounded viewport over the log history.
//!
//! Only the rows that fit in the viewport are materialized, so the cost of a
//! redraw depends on the viewport height and never on how many records the
//! history holds.

use std::ops::Range;

use crate::history::LogHistory;
use crate::types::LogRecord;

pub const EMPTY_STATE: &str = "Waiting for scan output...";

/// What to draw for the current viewport.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedWindow<'a> {
    Empty,
    Rows {
        range: Range<usize>,
        total: usize,
        rows: Vec<&'a LogRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFeed {
    viewport_height: u16,
    row_height: u16,
    offset: usize,
    follow: bool,
}

impl RenderFeed {
    /// Viewport and row heights share a unit (terminal lines, pixels, ...).
    /// Follow mode starts enabled.
    pub fn new(viewport_height: u16, row_height: u16) -> Self {
        Self {
            viewport_height,
            row_height: row_height.max(1),
            offset: 0,
            follow: true,
        }
    }

    pub fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whole rows that fit in the viewport.
    pub fn rows(&self) -> usize {
        (self.viewport_height / self.row_height) as usize
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn follow(&self) -> bool {
        self.follow
    }

    pub fn set_follow(&mut self, follow: bool) {
        self.follow = follow;
    }

    fn max_offset(&self, total: usize) -> usize {
        total.saturating_sub(self.rows())
    }

    /// Index range visible for a list of `total` items.
    pub fn visible_range(&self, total: usize) -> Range<usize> {
        let rows = self.rows();
        if total == 0 || rows == 0 {
            return 0..0;
        }
        let start = self.offset.min(self.max_offset(total));
        start..(start + rows).min(total)
    }

    /// Re-anchor after the list changed size. With follow on, the newest
    /// item is kept in view.
    pub fn sync(&mut self, total: usize) {
        self.offset = if self.follow {
            self.max_offset(total)
        } else {
            self.offset.min(self.max_offset(total))
        };
    }

    /// Move by `delta` rows. Follow mode is left as it is, so the next
    /// `sync` with follow on jumps back to the tail.
    pub fn scroll(&mut self, delta: isize, total: usize) {
        self.offset = self
            .offset
            .saturating_add_signed(delta)
            .min(self.max_offset(total));
    }

    pub fn scroll_to_tail(&mut self, total: usize) {
        self.offset = self.max_offset(total);
    }

    pub fn window<'a>(&mut self, history: &'a LogHistory) -> FeedWindow<'a> {
        let total = history.len();
        self.sync(total);
        if total == 0 {
            return FeedWindow::Empty;
        }
        let range = self.visible_range(total);
        let rows = history.slice(range.clone()).collect();
        FeedWindow::Rows { range, total, rows }
    }

    /// Text lines for a terminal viewport, or the empty-state line.
    pub fn render(&mut self, history: &LogHistory) -> Vec<String> {
        match self.window(history) {
            FeedWindow::Empty => vec![EMPTY_STATE.to_string()],
            FeedWindow::Rows { rows, .. } => rows.into_iter().map(format_line).collect(),
        }
    }
}

/// `HH:MM:SS LVL [source] message`
pub fn format_line(record: &LogRecord) -> String {
    let clock = record
        .timestamp
        .split_once('T')
        .map(|(_, t)| t.get(..8).unwrap_or(t))
        .unwrap_or(record.timestamp.as_str());
    if record.source.is_empty() {
        format!("{clock} {} {}", record.level.badge(), record.message)
    } else {
        format!(
            "{clock} {} [{}] {}",
            record.level.badge(),
            record.source,
            record.message
        )
    }
}
