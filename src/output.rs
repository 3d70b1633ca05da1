//! Output handling and buffering for server logs.
//!
//! This module provides `LogRing`, the bounded per-server buffer that the output
//! drain appends to and every subscriber pages through, plus helpers to decode raw
//! child output and sanitize it for display.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use strip_ansi_escapes::strip;

/// Default number of lines kept per server.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// One page of lines returned by [`LogRing::range`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    /// Lines in the requested order (newest-first when reversed).
    pub lines: Vec<String>,
    /// Number of lines currently stored, not the lifetime append count.
    pub total: usize,
    /// Whether more lines exist beyond this page in the paging direction.
    pub has_more: bool,
}

impl LogPage {
    fn empty(total: usize) -> Self {
        Self {
            lines: Vec::new(),
            total,
            has_more: false,
        }
    }
}

#[derive(Debug)]
struct RingState {
    lines: VecDeque<String>,
    last_push: Option<Instant>,
}

/// A fixed-capacity, thread-safe ring buffer of output lines.
///
/// A single drain task appends while any number of readers (UI loop, MCP handler,
/// a blocking thread) page through it. Every access takes the same lock, so a reader
/// never observes a half-applied push.
#[derive(Debug)]
pub struct LogRing {
    max_lines: usize,
    state: Mutex<RingState>,
}

impl LogRing {
    /// Creates a new `LogRing` holding at most `max_lines` lines (at least one).
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            state: Mutex::new(RingState {
                lines: VecDeque::with_capacity(max_lines.min(1024)),
                last_push: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of lines kept.
    pub fn capacity(&self) -> usize {
        self.max_lines
    }

    /// Appends a line, evicting the oldest one when full.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&self, line: impl Into<String>) -> bool {
        let mut state = self.lock();
        let mut dropped = false;
        while state.lines.len() >= self.max_lines {
            state.lines.pop_front();
            dropped = true;
        }
        state.lines.push_back(line.into());
        state.last_push = Some(Instant::now());
        dropped
    }

    /// Returns the number of lines currently stored.
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stored line.
    pub fn clear(&self) {
        self.lock().lines.clear();
    }

    /// When the most recent line was appended.
    pub fn last_activity(&self) -> Option<Instant> {
        self.lock().last_push
    }

    /// Reads a window of at most `limit` lines.
    ///
    /// A negative `offset` counts back from the end: `-k` is treated as
    /// `max(0, total - k)`. With `reverse` the window ends `offset` lines before the
    /// newest line and is returned newest-first; otherwise it starts at `offset` and
    /// is returned oldest-first.
    pub fn range(&self, offset: i64, limit: usize, reverse: bool) -> LogPage {
        let state = self.lock();
        let lines = &state.lines;
        let total = lines.len();
        let offset = normalize_offset(offset, total);
        if offset >= total {
            return LogPage::empty(total);
        }

        if reverse {
            let end = total - offset;
            let start = end.saturating_sub(limit);
            LogPage {
                lines: lines.range(start..end).rev().cloned().collect(),
                total,
                has_more: start > 0,
            }
        } else {
            let end = offset.saturating_add(limit).min(total);
            LogPage {
                lines: lines.range(offset..end).cloned().collect(),
                total,
                has_more: end < total,
            }
        }
    }
}

fn normalize_offset(offset: i64, total: usize) -> usize {
    if offset < 0 {
        let back = usize::try_from(offset.unsigned_abs()).unwrap_or(usize::MAX);
        total.saturating_sub(back)
    } else {
        usize::try_from(offset).unwrap_or(usize::MAX)
    }
}

/// Decodes one raw line of child output.
///
/// Invalid UTF-8 is replaced rather than rejected and trailing whitespace
/// (including the line terminator) is removed.
pub fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_string()
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    fn filled(capacity: usize, count: usize) -> LogRing {
        let ring = LogRing::new(capacity);
        for idx in 0..count {
            ring.push(format!("L{}", idx));
        }
        ring
    }

    fn names(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|idx| format!("L{}", idx)).collect()
    }

    #[test]
    fn ring_drops_oldest() {
        let ring = LogRing::new(2);
        assert!(!ring.push("a"));
        assert!(!ring.push("b"));
        assert!(ring.push("c"));
        let page = ring.range(0, 10, false);
        assert_eq!(page.lines, vec!["b", "c"]);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn capacity_keeps_the_newest_lines() {
        let ring = filled(100, 250);
        assert_eq!(ring.len(), 100);
        let page = ring.range(0, 1, false);
        // 1-indexed append number 151 is "L150".
        assert_eq!(page.lines, vec!["L150"]);
    }

    #[test]
    fn full_reverse_read_returns_everything_newest_first() {
        let ring = filled(50, 30);
        let page = ring.range(0, ring.len(), true);
        let mut expected = names(0..30);
        expected.reverse();
        assert_eq!(page.lines, expected);
        assert!(!page.has_more);
    }

    #[test]
    fn reverse_pages_walk_back_through_history() {
        let ring = filled(500, 150);

        let first = ring.range(0, 100, true);
        let mut expected = names(50..150);
        expected.reverse();
        assert_eq!(first.lines, expected);
        assert_eq!(first.total, 150);
        assert!(first.has_more);

        let last = ring.range(140, 100, true);
        let mut expected = names(0..10);
        expected.reverse();
        assert_eq!(last.lines, expected);
        assert!(!last.has_more);
    }

    #[test]
    fn forward_pages_report_remaining_lines() {
        let ring = filled(500, 150);
        let page = ring.range(0, 10, false);
        assert_eq!(page.lines, names(0..10));
        assert!(page.has_more);

        let tail = ring.range(145, 10, false);
        assert_eq!(tail.lines, names(145..150));
        assert!(!tail.has_more);
    }

    #[test]
    fn negative_offset_counts_from_the_end() {
        let ring = filled(500, 150);
        for (negative, positive) in [(-20, 130), (-1, 149), (-500, 0)] {
            assert_eq!(ring.range(negative, 10, true), ring.range(positive, 10, true));
            assert_eq!(ring.range(negative, 10, false), ring.range(positive, 10, false));
        }
    }

    #[test]
    fn offset_past_the_end_is_empty() {
        let ring = filled(500, 150);
        assert_eq!(ring.range(200, 10, true), LogPage::empty(150));
        assert_eq!(ring.range(150, 10, false), LogPage::empty(150));
        assert_eq!(LogRing::new(10).range(0, 10, true), LogPage::empty(0));
    }

    #[test]
    fn clear_resets_total() {
        let ring = filled(10, 5);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.range(0, 10, true).total, 0);
    }

    #[test]
    fn concurrent_readers_see_whole_lines() {
        let ring = Arc::new(LogRing::new(64));
        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for idx in 0..2_000 {
                    ring.push(format!("line-{idx}"));
                }
            })
        };
        for _ in 0..200 {
            let page = ring.range(0, 64, true);
            assert!(page.lines.len() <= 64);
            assert!(page.lines.iter().all(|line| line.starts_with("line-")));
        }
        writer.join().unwrap();
        assert_eq!(ring.len(), 64);
        assert_eq!(ring.range(0, 1, true).lines, vec!["line-1999"]);
    }

    #[test]
    fn decode_line_replaces_invalid_bytes() {
        assert_eq!(decode_line(b"ready on :3000\r\n"), "ready on :3000");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[test]
    fn sanitize_text_strips_ansi() {
        assert_eq!(sanitize_text("\u{1b}[32mok\u{1b}[0m", true), "ok");
        assert_eq!(sanitize_text("\u{1b}[32mok", false), "\u{1b}[32mok");
    }
}
