//! One terminal row
//!
//! A [`LineBuffer`] holds the characters of a single screen line together with
//! its styled ranges. Ranges are either closed (start and end known) or open,
//! meaning they still grow as characters are written. Every mutation refreshes
//! the line's version id and drops the memoized render.

use std::cell::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Upper bound on simultaneously open style ranges per line
pub const MAX_OPEN_STYLES: usize = 20;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonically increasing version id
pub fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("column {column} is past the end of a {capacity}-column line")]
pub struct LineOverflow {
    pub column: usize,
    pub capacity: usize,
}

/// 24-bit color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const fn from_u32(rgb: u32) -> Self {
        Self((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
    }

    /// Convert to crossterm color
    pub fn to_crossterm(self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.0,
            g: self.1,
            b: self.2,
        }
    }
}

/// Visual attribute carried by a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    Foreground(Rgb),
}

/// A styled range `[start, end)` of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub style: Style,
    /// Group name used to close related ranges together
    pub tag: &'static str,
}

/// Immutable rendering of a line: text plus the spans that apply to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledLine {
    pub text: String,
    pub spans: Vec<Span>,
    pub version: u64,
}

impl StyledLine {
    /// Number of characters (not bytes) in the line
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

pub struct LineBuffer {
    text: Vec<char>,
    capacity: usize,
    spans: Vec<Span>,
    open: Vec<Span>,
    version: u64,
    rendered: OnceCell<Arc<StyledLine>>,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: Vec::with_capacity(capacity),
            capacity,
            spans: Vec::new(),
            open: Vec::new(),
            version: next_version(),
            rendered: OnceCell::new(),
        }
    }

    pub fn from_text(text: &str, capacity: usize) -> Self {
        let mut line = Self::new(capacity);
        line.text.extend(text.chars().take(capacity));
        line
    }

    /// Occupied cells
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn char_at(&self, column: usize) -> Option<char> {
        self.text.get(column).copied()
    }

    pub fn open_styles(&self) -> &[Span] {
        &self.open
    }

    fn touch(&mut self) {
        self.version = next_version();
        self.rendered.take();
    }

    /// Record a closed range. Older ranges it fully covers can never show
    /// again and are dropped.
    fn push_closed(&mut self, span: Span) {
        if span.end <= span.start {
            return;
        }
        self.spans
            .retain(|old| old.start < span.start || old.end > span.end);
        self.spans.push(span);
    }

    /// Forget closed ranges past the end of the text; clip the rest
    fn prune_spans(&mut self) {
        let len = self.text.len();
        self.spans.retain(|span| span.start < len);
        for span in &mut self.spans {
            span.end = span.end.min(len);
        }
    }

    fn pad_to(&mut self, len: usize) -> usize {
        let before = self.text.len();
        if len > before {
            self.text.resize(len, ' ');
        }
        self.text.len() - before
    }

    /// Write `c` at `column`, padding any gap with spaces.
    ///
    /// Returns the number of newly occupied cells (0 when overwriting).
    pub fn put_char(
        &mut self,
        c: char,
        column: usize,
        extend_open_styles: bool,
    ) -> Result<usize, LineOverflow> {
        if column >= self.capacity {
            return Err(LineOverflow {
                column,
                capacity: self.capacity,
            });
        }
        let added = self.pad_to(column + 1);
        self.text[column] = c;

        if extend_open_styles {
            for span in &mut self.open {
                span.end = span.end.max(column + 1);
            }
        }
        self.touch();
        Ok(added)
    }

    /// Make sure the cell under `column` exists; open styles are stretched up
    /// to it. Returns the number of cells added.
    pub fn extend_to(&mut self, column: usize) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        let column = column.min(self.capacity - 1);
        let added = self.pad_to(column + 1);
        let mut stretched = false;
        for span in self.open.iter_mut().filter(|span| span.end < column) {
            span.end = column;
            stretched = true;
        }
        if added > 0 || stretched {
            self.touch();
        }
        added
    }

    /// Empty the line and forget its styles
    pub fn clear(&mut self) -> isize {
        let released = self.text.len();
        self.text.clear();
        self.spans.clear();
        self.open.clear();
        self.touch();
        -(released as isize)
    }

    /// Blank everything through `column` and drop whatever follows
    pub fn truncate_at(&mut self, column: usize) -> isize {
        if column >= self.capacity {
            return 0;
        }
        let before = self.text.len();
        self.text.truncate(column + 1);
        self.pad_to(column + 1);
        self.text.fill(' ');
        self.prune_spans();
        self.touch();
        self.text.len() as isize - before as isize
    }

    /// Drop the cells from `column` to the end of the line
    pub fn clear_from(&mut self, column: usize) -> isize {
        if column >= self.text.len() {
            return 0;
        }
        let before = self.text.len();
        self.text.truncate(column);
        self.prune_spans();
        self.touch();
        column as isize - before as isize
    }

    /// Blank the cells from the start of the line through `column`
    pub fn clear_to(&mut self, column: usize) -> isize {
        let end = (column + 1).min(self.text.len());
        if end > 0 {
            self.text[..end].fill(' ');
            self.touch();
        }
        0
    }

    /// Start a range at `column`; ignored once [`MAX_OPEN_STYLES`] are open
    pub fn open_style(&mut self, style: Style, column: usize, tag: &'static str) {
        if self.open.len() >= MAX_OPEN_STYLES {
            tracing::debug!("Too many open styles, dropping {:?}", style);
            return;
        }
        self.open.push(Span {
            start: column,
            end: column,
            style,
            tag,
        });
        self.touch();
    }

    /// Close every open range carrying `tag` at `column`
    pub fn close_styles_by_tag(&mut self, column: usize, tag: &'static str) {
        let before = self.open.len();
        let mut i = 0;
        while i < self.open.len() {
            if self.open[i].tag == tag {
                let mut span = self.open.remove(i);
                span.end = column;
                self.push_closed(span);
            } else {
                i += 1;
            }
        }
        if self.open.len() != before {
            self.touch();
        }
    }

    pub fn close_all_styles(&mut self, column: usize) {
        for mut span in std::mem::take(&mut self.open) {
            span.end = span.end.max(column);
            self.push_closed(span);
        }
        self.touch();
    }

    /// Change the line width, truncating content that no longer fits
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity == self.capacity {
            return;
        }
        self.capacity = capacity;
        self.text.truncate(capacity);
        self.prune_spans();
        self.touch();
    }

    /// Text and spans (closed and open) clipped to the current length.
    /// Memoized until the next mutation.
    pub fn render(&self) -> Arc<StyledLine> {
        self.rendered
            .get_or_init(|| {
                let len = self.text.len();
                let spans = self
                    .spans
                    .iter()
                    .chain(self.open.iter())
                    .filter(|span| span.start < len)
                    .map(|span| Span {
                        end: span.end.min(len),
                        ..*span
                    })
                    .filter(|span| span.end > span.start)
                    .collect();
                Arc::new(StyledLine {
                    text: self.text.iter().collect(),
                    spans,
                    version: self.version,
                })
            })
            .clone()
    }
}

impl std::fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineBuffer")
            .field("text", &self.text.iter().collect::<String>())
            .field("capacity", &self.capacity)
            .field("spans", &self.spans)
            .field("open", &self.open)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Style = Style::Foreground(Rgb(0xBB, 0, 0));
    const GREEN: Style = Style::Foreground(Rgb(0, 0xBB, 0));

    fn text(line: &LineBuffer) -> String {
        line.render().text.clone()
    }

    #[test]
    fn test_put_char_pads_gap() {
        let mut line = LineBuffer::new(10);
        assert_eq!(line.put_char('x', 3, false), Ok(4));
        assert_eq!(text(&line), "   x");
        assert_eq!(line.put_char('a', 0, false), Ok(0));
        assert_eq!(text(&line), "a  x");
    }

    #[test]
    fn test_put_char_past_capacity_overflows() {
        let mut line = LineBuffer::new(4);
        assert_eq!(
            line.put_char('x', 4, false),
            Err(LineOverflow {
                column: 4,
                capacity: 4
            })
        );
        assert!(line.is_empty());
    }

    #[test]
    fn test_erase_variants() {
        let mut line = LineBuffer::from_text("HELLO", 80);
        assert_eq!(line.clear_from(2), -3);
        assert_eq!(text(&line), "HE");

        let mut line = LineBuffer::from_text("HELLO", 80);
        assert_eq!(line.clear_to(2), 0);
        assert_eq!(text(&line), "   LO");

        let mut line = LineBuffer::from_text("HELLO", 80);
        assert_eq!(line.truncate_at(2), -2);
        assert_eq!(text(&line), "   ");

        let mut line = LineBuffer::from_text("HELLO", 80);
        assert_eq!(line.clear(), -5);
        assert!(line.is_empty());
    }

    #[test]
    fn test_erase_past_end_is_noop() {
        let mut line = LineBuffer::from_text("HI", 80);
        assert_eq!(line.clear_from(5), 0);
        assert_eq!(text(&line), "HI");
        assert_eq!(line.truncate_at(80), 0);
    }

    #[test]
    fn test_extend_to_pads_and_stretches_open_styles() {
        let mut line = LineBuffer::from_text("ab", 80);
        line.open_style(RED, 2, "color");
        assert_eq!(line.extend_to(7), 6);
        assert_eq!(line.len(), 8);
        assert_eq!(line.open_styles()[0].end, 7);
        assert_eq!(line.extend_to(3), 0);
    }

    #[test]
    fn test_styles_open_and_close() {
        let mut line = LineBuffer::new(80);
        line.open_style(RED, 0, "color");
        for (i, c) in "red".chars().enumerate() {
            line.put_char(c, i, true).unwrap();
        }
        line.close_styles_by_tag(3, "color");
        line.open_style(GREEN, 3, "color");
        line.put_char('g', 3, true).unwrap();

        let rendered = line.render();
        assert_eq!(rendered.text, "redg");
        assert_eq!(
            rendered.spans,
            vec![
                Span {
                    start: 0,
                    end: 3,
                    style: RED,
                    tag: "color"
                },
                Span {
                    start: 3,
                    end: 4,
                    style: GREEN,
                    tag: "color"
                },
            ]
        );
    }

    #[test]
    fn test_empty_ranges_are_discarded() {
        let mut line = LineBuffer::new(80);
        line.open_style(RED, 0, "color");
        line.close_all_styles(0);
        line.open_style(GREEN, 0, "color");
        line.close_styles_by_tag(0, "color");
        assert!(line.render().spans.is_empty());
        assert!(line.open_styles().is_empty());
    }

    #[test]
    fn test_open_styles_are_capped() {
        let mut line = LineBuffer::new(80);
        for _ in 0..25 {
            line.open_style(RED, 0, "color");
        }
        assert_eq!(line.open_styles().len(), MAX_OPEN_STYLES);
    }

    #[test]
    fn test_render_is_memoized_until_mutation() {
        let mut line = LineBuffer::from_text("abc", 80);
        let first = line.render();
        assert!(Arc::ptr_eq(&first, &line.render()));

        line.put_char('z', 1, false).unwrap();
        let second = line.render();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.text, "azc");
        assert!(second.version > first.version);
    }

    #[test]
    fn test_render_clips_spans_to_length() {
        let mut line = LineBuffer::from_text("abcdef", 80);
        line.open_style(RED, 1, "color");
        line.extend_to(5);
        line.close_all_styles(5);
        line.clear_from(3);

        let rendered = line.render();
        assert_eq!(rendered.spans.len(), 1);
        assert_eq!((rendered.spans[0].start, rendered.spans[0].end), (1, 3));
    }

    #[test]
    fn test_versions_increase_on_every_mutation() {
        let mut line = LineBuffer::new(80);
        let mut last = line.version();
        line.put_char('a', 0, false).unwrap();
        assert!(line.version() > last);
        last = line.version();
        line.clear_to(0);
        assert!(line.version() > last);
        last = line.version();
        line.set_capacity(40);
        assert!(line.version() > last);
    }

    #[test]
    fn test_redrawn_line_keeps_spans_bounded() {
        let mut line = LineBuffer::new(80);
        for _ in 0..10_000 {
            line.open_style(RED, 0, "color");
            for (i, c) in "50%".chars().enumerate() {
                line.put_char(c, i, true).unwrap();
            }
            line.close_all_styles(3);
        }
        assert_eq!(line.spans.len(), 1);
        assert_eq!(line.render().spans.len(), 1);

        line.open_style(GREEN, 1, "color");
        line.put_char('x', 1, true).unwrap();
        line.close_styles_by_tag(2, "color");
        assert_eq!(line.spans.len(), 2);
        for _ in 0..100 {
            line.open_style(GREEN, 0, "color");
            line.close_styles_by_tag(3, "color");
        }
        assert_eq!(line.spans.len(), 1);
        assert_eq!(line.render().spans[0].style, GREEN);
    }

    #[test]
    fn test_erase_forgets_spans_past_end() {
        let mut line = LineBuffer::from_text("abcdef", 80);
        line.open_style(RED, 4, "color");
        line.close_all_styles(6);
        line.open_style(GREEN, 0, "color");
        line.close_all_styles(3);
        assert_eq!(line.spans.len(), 2);

        line.clear_from(4);
        assert_eq!(line.spans.len(), 1);
        line.put_char('z', 5, false).unwrap();
        assert_eq!(line.render().spans.len(), 1);

        line.truncate_at(1);
        assert_eq!(line.spans, vec![Span { start: 0, end: 2, style: GREEN, tag: "color" }]);

        line.set_capacity(0);
        assert!(line.spans.is_empty());
    }

    #[test]
    fn test_set_capacity_truncates() {
        let mut line = LineBuffer::from_text("0123456789", 80);
        line.set_capacity(4);
        assert_eq!(text(&line), "0123");
        assert!(line.put_char('x', 4, false).is_err());
    }
}
