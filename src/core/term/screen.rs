//! Screen model
//!
//! The scrollback buffer of a serial terminal: an ordered list of
//! [`LineBuffer`]s, a cursor, the remembered graphic rendition and a character
//! budget that evicts the oldest lines. The last `height` lines form the
//! visible window that cursor positioning sequences address.

use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;

use super::line::{LineBuffer, Rgb, Style, StyledLine};
use crate::config::ScreenConfig;

/// Tag shared by all foreground color ranges
pub const COLOR_TAG: &str = "color";

const COLORS_30_37: [Rgb; 8] = [
    Rgb::from_u32(0x000000),
    Rgb::from_u32(0xBB0000),
    Rgb::from_u32(0x00BB00),
    Rgb::from_u32(0xBBBB00),
    Rgb::from_u32(0x0000BB),
    Rgb::from_u32(0xBB00BB),
    Rgb::from_u32(0x00BBBB),
    Rgb::from_u32(0xBBBBBB),
];

const COLORS_90_97: [Rgb; 8] = [
    Rgb::from_u32(0x555555),
    Rgb::from_u32(0xFF5555),
    Rgb::from_u32(0x55FF55),
    Rgb::from_u32(0xFFFF55),
    Rgb::from_u32(0x5555FF),
    Rgb::from_u32(0xFF55FF),
    Rgb::from_u32(0x55FFFF),
    Rgb::from_u32(0xFFFFFF),
];

/// Cursor location: line index into the whole buffer, column within the line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorPosition {
    pub line: usize,
    pub column: usize,
}

bitflags! {
    /// Hints for the renderer, consumed by [`ScreenModel::render_snapshot`]
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SnapshotFlags: u8 {
        const FULL_REDRAW      = 0b01;
        const SCROLL_TO_BOTTOM = 0b10;
    }
}

/// Immutable view of the screen handed to renderers
#[derive(Debug, Clone, Default)]
pub struct ScreenSnapshot {
    pub lines: Vec<Arc<StyledLine>>,
    pub cursor: CursorPosition,
    pub first_visible: usize,
    pub width: u16,
    pub height: u16,
    pub flags: SnapshotFlags,
}

impl ScreenSnapshot {
    /// Lines of the visible window
    pub fn visible(&self) -> &[Arc<StyledLine>] {
        &self.lines[self.first_visible.min(self.lines.len())..]
    }
}

/// Reply that needs to be sent back to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(usize, usize),
    /// Device status: ESC [ 0 n
    StatusOk,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            Response::StatusOk => b"\x1b[0n".to_vec(),
        }
    }
}

/// Side effects queued by the screen for the session to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Reply(Response),
    Bell,
}

pub struct ScreenModel {
    lines: VecDeque<LineBuffer>,
    cursor: CursorPosition,
    /// Last column was written; the next printable starts a new line
    wrap_pending: bool,
    rendition: Vec<i32>,
    /// Occupied cells plus one per line break
    total_chars: usize,
    retention_chars: usize,
    hysteresis: usize,
    width: usize,
    height: usize,
    sound: bool,
    outbox: Vec<Output>,
    flags: SnapshotFlags,
}

impl Default for ScreenModel {
    fn default() -> Self {
        Self::new(&ScreenConfig::default())
    }
}

impl ScreenModel {
    pub fn new(config: &ScreenConfig) -> Self {
        let width = usize::from(config.width.max(1));
        let mut lines = VecDeque::new();
        lines.push_back(LineBuffer::new(width));
        Self {
            lines,
            cursor: CursorPosition::default(),
            wrap_pending: false,
            rendition: Vec::new(),
            total_chars: 1,
            retention_chars: config.retention_chars,
            hysteresis: config.hysteresis,
            width,
            height: usize::from(config.height.max(1)),
            sound: config.sound,
            outbox: Vec::new(),
            flags: SnapshotFlags::FULL_REDRAW,
        }
    }

    pub fn cursor(&self) -> CursorPosition {
        self.cursor
    }

    pub fn wrap_pending(&self) -> bool {
        self.wrap_pending
    }

    pub fn width(&self) -> u16 {
        self.width as u16
    }

    pub fn height(&self) -> u16 {
        self.height as u16
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Panics when `index` is out of bounds
    pub fn line(&self, index: usize) -> &LineBuffer {
        &self.lines[index]
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn retention_chars(&self) -> usize {
        self.retention_chars
    }

    pub fn set_sound(&mut self, sound: bool) {
        self.sound = sound;
    }

    /// Index of the first line of the visible window
    pub fn first_visible_line(&self) -> usize {
        self.lines.len().saturating_sub(self.height)
    }

    fn current_line(&mut self) -> &mut LineBuffer {
        &mut self.lines[self.cursor.line]
    }

    fn adjust_total(&mut self, delta: isize) {
        self.total_chars = self.total_chars.saturating_add_signed(delta);
    }

    fn push_line(&mut self) {
        self.lines.push_back(LineBuffer::new(self.width));
        self.total_chars += 1;
    }

    fn extend_current_line(&mut self) {
        let column = self.cursor.column;
        let added = self.current_line().extend_to(column);
        self.total_chars += added;
    }

    fn trim(&mut self) {
        if self.total_chars <= self.retention_chars + self.hysteresis {
            return;
        }
        let before = self.lines.len();
        while self.cursor.line > 0 {
            let first = self.lines[0].len() + 1;
            if self.total_chars - first <= self.retention_chars {
                break;
            }
            self.lines.pop_front();
            self.total_chars -= first;
            self.cursor.line -= 1;
        }
        tracing::debug!(
            "Trimmed {} lines, {} chars in {} lines",
            before - self.lines.len(),
            self.total_chars,
            self.lines.len()
        );
    }

    /// Move to column 0 of the next line, creating it if needed
    pub fn new_line(&mut self) {
        self.wrap_pending = false;
        self.cursor.line += 1;
        self.cursor.column = 0;
        if self.cursor.line >= self.lines.len() {
            self.push_line();
            self.trim();
            let rendition = self.rendition.clone();
            self.select_graphic_rendition(&rendition, false);
        }
    }

    /// Write a printable character at the cursor and advance
    pub fn put_printable(&mut self, c: char) {
        if self.wrap_pending {
            self.new_line();
        }
        let column = self.cursor.column;
        match self.current_line().put_char(c, column, true) {
            Ok(added) => self.total_chars += added,
            Err(_) => {
                self.new_line();
                if let Ok(added) = self.current_line().put_char(c, 0, true) {
                    self.total_chars += added;
                }
            }
        }
        if self.cursor.column + 1 >= self.width {
            self.wrap_pending = true;
        } else {
            self.cursor.column += 1;
        }
    }

    pub fn carriage_return(&mut self) {
        self.wrap_pending = false;
        self.cursor.column = 0;
    }

    pub fn backspace(&mut self) {
        self.wrap_pending = false;
        self.cursor.column = self.cursor.column.saturating_sub(1);
    }

    /// Advance to the next multiple of 8, stopping at the last column
    pub fn tab(&mut self) {
        self.wrap_pending = false;
        self.cursor.column = ((self.cursor.column + 8) & !7).min(self.width - 1);
        self.extend_current_line();
    }

    pub fn cursor_up(&mut self, n: usize) {
        self.wrap_pending = false;
        self.cursor.line = self.cursor.line.saturating_sub(n);
        self.extend_current_line();
    }

    pub fn cursor_down(&mut self, n: usize) {
        self.wrap_pending = false;
        self.cursor.line = self
            .cursor
            .line
            .saturating_add(n)
            .min(self.lines.len() - 1);
        self.extend_current_line();
    }

    pub fn cursor_forward(&mut self, n: usize) {
        self.wrap_pending = false;
        self.cursor.column = self.cursor.column.saturating_add(n).min(self.width - 1);
        self.extend_current_line();
    }

    pub fn cursor_backward(&mut self, n: usize) {
        self.wrap_pending = false;
        self.cursor.column = self.cursor.column.saturating_sub(n);
    }

    /// Move to a 0-based column of the current line
    pub fn cursor_to_column(&mut self, column: usize) {
        self.wrap_pending = false;
        self.cursor.column = column.min(self.width - 1);
        self.extend_current_line();
    }

    /// EL: 0 = cursor to end, 1 = start through cursor, 2 = whole line
    pub fn erase_line(&mut self, mode: i32) {
        let column = self.cursor.column;
        let delta = match mode {
            0 => self.current_line().clear_from(column),
            1 => self.current_line().clear_to(column),
            2 => self.current_line().truncate_at(column),
            _ => {
                tracing::debug!("Unsupported erase line mode {}", mode);
                return;
            }
        };
        self.adjust_total(delta);
    }

    /// ED: 0 = cursor to bottom, 2 = the whole visible window
    pub fn erase_display(&mut self, mode: i32) {
        match mode {
            0 => {
                self.erase_line(0);
                for index in self.cursor.line + 1..self.lines.len() {
                    let delta = self.lines[index].clear();
                    self.adjust_total(delta);
                }
            }
            2 => {
                let saved = self.cursor;
                let wrap_pending = self.wrap_pending;
                self.position_cursor_in_window(1, 1);
                self.erase_display(0);
                let delta = self.lines[saved.line].truncate_at(saved.column);
                self.adjust_total(delta);
                self.cursor = saved;
                self.wrap_pending = wrap_pending;
            }
            _ => tracing::debug!("Unsupported erase display mode {}", mode),
        }
    }

    /// CUP with 1-based coordinates relative to the visible window
    pub fn position_cursor_in_window(&mut self, row: i32, column: i32) {
        let row = row.clamp(1, self.height as i32) as usize;
        let column = column.clamp(1, self.width as i32) as usize;
        let target = self.first_visible_line() + row - 1;
        while target >= self.lines.len() {
            self.push_line();
        }
        self.wrap_pending = false;
        self.cursor = CursorPosition {
            line: target,
            column: column - 1,
        };
    }

    /// SGR. With `remember` the codes are replayed on every new line
    pub fn select_graphic_rendition(&mut self, params: &[i32], remember: bool) {
        let column = self.cursor.column;
        for &code in params {
            match code {
                0 => {
                    self.current_line().close_all_styles(column);
                    if remember {
                        self.rendition.clear();
                    }
                }
                30..=37 | 90..=97 => {
                    let color = if code < 90 {
                        COLORS_30_37[(code - 30) as usize]
                    } else {
                        COLORS_90_97[(code - 90) as usize]
                    };
                    let line = self.current_line();
                    line.close_styles_by_tag(column, COLOR_TAG);
                    line.open_style(Style::Foreground(color), column, COLOR_TAG);
                    if remember {
                        self.rendition
                            .retain(|&old| !matches!(old, 30..=37 | 90..=97));
                        self.rendition.push(code);
                    }
                }
                49 => {}
                _ => tracing::warn!("Unsupported SGR parameter {}", code),
            }
        }
    }

    /// DSR: 6 reports the cursor position, 5 reports "ok"
    pub fn device_status_report(&mut self, code: i32) {
        match code {
            6 => {
                // Row counts from the top of the visible window, the same
                // origin CUP uses, rather than from the start of the buffer
                let row = self.cursor.line.saturating_sub(self.first_visible_line()) + 1;
                let response = Response::CursorPosition(row, self.cursor.column + 1);
                self.outbox.push(Output::Reply(response));
            }
            5 => self.outbox.push(Output::Reply(Response::StatusOk)),
            _ => tracing::warn!("Unsupported device status report {}", code),
        }
    }

    pub fn beep(&mut self) {
        if self.sound {
            self.outbox.push(Output::Bell);
        }
    }

    /// Drain replies and bell requests queued since the last call
    pub fn take_output(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outbox)
    }

    pub fn set_width(&mut self, width: u16) {
        let width = usize::from(width.max(1));
        if width == self.width {
            return;
        }
        tracing::debug!("Screen width {} -> {}", self.width, width);
        self.width = width;
        for line in &mut self.lines {
            line.set_capacity(width);
        }
        self.total_chars = self.lines.iter().map(|line| line.len() + 1).sum();
        self.cursor.column = self.cursor.column.min(width - 1);
        self.wrap_pending = false;
        self.flags |= SnapshotFlags::FULL_REDRAW;
    }

    pub fn set_height(&mut self, height: u16) {
        let height = usize::from(height.max(1));
        if height == self.height {
            return;
        }
        self.height = height;
        self.flags |= SnapshotFlags::FULL_REDRAW;
    }

    pub fn set_dimensions(&mut self, width: u16, height: u16) {
        self.set_width(width);
        self.set_height(height);
    }

    pub fn set_retention_chars(&mut self, chars: usize) {
        self.retention_chars = chars;
        self.trim();
    }

    /// Empty buffer with a single blank line and the cursor home
    pub fn clear(&mut self) {
        self.lines.clear();
        self.lines.push_back(LineBuffer::new(self.width));
        self.total_chars = 1;
        self.cursor = CursorPosition::default();
        self.wrap_pending = false;
        self.rendition.clear();
        self.outbox.clear();
        self.flags |= SnapshotFlags::FULL_REDRAW | SnapshotFlags::SCROLL_TO_BOTTOM;
    }

    pub fn request_scroll_to_bottom(&mut self) {
        self.flags |= SnapshotFlags::SCROLL_TO_BOTTOM;
    }

    /// Render every line, consuming the pending snapshot flags
    pub fn render_snapshot(&mut self) -> ScreenSnapshot {
        ScreenSnapshot {
            lines: self.lines.iter().map(LineBuffer::render).collect(),
            cursor: self.cursor,
            first_visible: self.first_visible_line(),
            width: self.width(),
            height: self.height(),
            flags: std::mem::take(&mut self.flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen(width: u16, height: u16) -> ScreenModel {
        ScreenModel::new(&ScreenConfig {
            width,
            height,
            ..ScreenConfig::default()
        })
    }

    fn write(screen: &mut ScreenModel, text: &str) {
        for c in text.chars() {
            screen.put_printable(c);
        }
    }

    fn text(screen: &ScreenModel, line: usize) -> String {
        screen.line(line).render().text.clone()
    }

    fn recount(screen: &ScreenModel) -> usize {
        (0..screen.line_count())
            .map(|i| screen.line(i).len() + 1)
            .sum()
    }

    #[test]
    fn test_write_and_new_line() {
        let mut screen = screen(80, 24);
        write(&mut screen, "AB");
        screen.new_line();

        assert_eq!(screen.line_count(), 2);
        assert_eq!(text(&screen, 0), "AB");
        assert_eq!(text(&screen, 1), "");
        assert_eq!(screen.cursor(), CursorPosition { line: 1, column: 0 });
        assert_eq!(screen.total_chars(), recount(&screen));
    }

    #[test]
    fn test_last_column_sets_wrap_pending() {
        let mut screen = screen(4, 24);
        write(&mut screen, "abcd");
        assert!(screen.wrap_pending());
        assert_eq!(screen.cursor(), CursorPosition { line: 0, column: 3 });

        write(&mut screen, "e");
        assert!(!screen.wrap_pending());
        assert_eq!(text(&screen, 0), "abcd");
        assert_eq!(text(&screen, 1), "e");
        assert_eq!(screen.cursor(), CursorPosition { line: 1, column: 1 });
    }

    #[test]
    fn test_carriage_return_cancels_wrap() {
        let mut screen = screen(4, 24);
        write(&mut screen, "abcd");
        screen.carriage_return();
        write(&mut screen, "X");
        assert_eq!(screen.line_count(), 1);
        assert_eq!(text(&screen, 0), "Xbcd");
    }

    #[test]
    fn test_cursor_moves_clamp() {
        let mut screen = screen(10, 24);
        screen.cursor_up(5);
        screen.cursor_backward(5);
        assert_eq!(screen.cursor(), CursorPosition::default());

        screen.cursor_forward(100);
        assert_eq!(screen.cursor().column, 9);
        assert_eq!(screen.line(0).len(), 10);

        screen.cursor_down(3);
        assert_eq!(screen.cursor().line, 0);
    }

    #[test]
    fn test_tab_stops() {
        let mut screen = screen(20, 24);
        screen.tab();
        assert_eq!(screen.cursor().column, 8);
        write(&mut screen, "x");
        screen.tab();
        assert_eq!(screen.cursor().column, 16);
        screen.tab();
        assert_eq!(screen.cursor().column, 19);
        assert_eq!(screen.line(0).len(), 20);
    }

    #[test]
    fn test_position_cursor_in_window() {
        let mut screen = screen(80, 24);
        screen.position_cursor_in_window(1, 5);
        assert_eq!(screen.cursor(), CursorPosition { line: 0, column: 4 });

        screen.position_cursor_in_window(0, 500);
        assert_eq!(screen.cursor(), CursorPosition { line: 0, column: 79 });

        screen.position_cursor_in_window(3, 1);
        assert_eq!(screen.line_count(), 3);
        assert_eq!(screen.cursor(), CursorPosition { line: 2, column: 0 });
        assert_eq!(screen.total_chars(), recount(&screen));
    }

    #[test]
    fn test_position_is_relative_to_visible_window() {
        let mut screen = screen(80, 5);
        for _ in 0..9 {
            screen.new_line();
        }
        assert_eq!(screen.first_visible_line(), 5);
        screen.position_cursor_in_window(2, 3);
        assert_eq!(screen.cursor(), CursorPosition { line: 6, column: 2 });

        screen.device_status_report(6);
        assert_eq!(
            screen.take_output(),
            vec![Output::Reply(Response::CursorPosition(2, 3))]
        );
    }

    #[test]
    fn test_erase_line_modes() {
        for (mode, expected) in [(0, "HE"), (1, "   LO"), (2, "   ")] {
            let mut screen = screen(80, 24);
            write(&mut screen, "HELLO");
            screen.cursor_to_column(2);
            screen.erase_line(mode);
            assert_eq!(text(&screen, 0), expected, "mode {}", mode);
            assert_eq!(screen.total_chars(), recount(&screen));
        }
    }

    #[test]
    fn test_erase_display_whole_window_keeps_cursor() {
        let mut screen = screen(80, 24);
        write(&mut screen, "one");
        screen.new_line();
        write(&mut screen, "two");
        screen.new_line();
        write(&mut screen, "three");
        screen.cursor_up(1);
        let cursor = screen.cursor();

        screen.erase_display(2);
        assert_eq!(screen.cursor(), cursor);
        for i in 0..screen.line_count() {
            assert!(text(&screen, i).trim().is_empty());
        }
        assert_eq!(screen.total_chars(), recount(&screen));
    }

    #[test]
    fn test_erase_display_below_cursor() {
        let mut screen = screen(80, 24);
        write(&mut screen, "keep");
        screen.new_line();
        write(&mut screen, "cut here");
        screen.new_line();
        write(&mut screen, "gone");
        screen.position_cursor_in_window(2, 4);

        screen.erase_display(0);
        assert_eq!(text(&screen, 0), "keep");
        assert_eq!(text(&screen, 1), "cut");
        assert_eq!(text(&screen, 2), "");
    }

    #[test]
    fn test_sgr_colors_and_reset() {
        let mut screen = screen(80, 24);
        screen.select_graphic_rendition(&[31], true);
        write(&mut screen, "red");
        screen.select_graphic_rendition(&[0], true);
        write(&mut screen, "plain");

        let spans = screen.line(0).render().spans.clone();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (0, 3));
        assert_eq!(spans[0].style, Style::Foreground(Rgb(0xBB, 0, 0)));
    }

    #[test]
    fn test_bright_color_replaces_previous_color() {
        let mut screen = screen(80, 24);
        screen.select_graphic_rendition(&[32], true);
        write(&mut screen, "ab");
        screen.select_graphic_rendition(&[94, 49, 7], true);
        write(&mut screen, "cd");

        let spans = screen.line(0).render().spans.clone();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].style, Style::Foreground(Rgb(0x55, 0x55, 0xFF)));
        assert_eq!((spans[1].start, spans[1].end), (2, 4));
    }

    #[test]
    fn test_rendition_is_replayed_on_new_lines() {
        let mut screen = screen(80, 24);
        screen.select_graphic_rendition(&[33], true);
        write(&mut screen, "a");
        screen.new_line();
        write(&mut screen, "b");

        let spans = screen.line(1).render().spans.clone();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].style, Style::Foreground(Rgb(0xBB, 0xBB, 0)));
    }

    #[test]
    fn test_color_changes_keep_rendition_bounded() {
        let mut screen = screen(80, 24);
        for i in 0..1_000 {
            let code = if i % 2 == 0 { 32 } else { 93 };
            screen.select_graphic_rendition(&[code], true);
            write(&mut screen, "ok");
        }
        assert_eq!(screen.rendition, vec![93]);

        screen.new_line();
        write(&mut screen, "x");
        let spans = screen.line(screen.cursor().line).render().spans.clone();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].style, Style::Foreground(Rgb(0xFF, 0xFF, 0x55)));
    }

    #[test]
    fn test_device_status_ok() {
        let mut screen = screen(80, 24);
        screen.device_status_report(5);
        screen.device_status_report(99);
        assert_eq!(screen.take_output(), vec![Output::Reply(Response::StatusOk)]);
        assert!(screen.take_output().is_empty());
        assert_eq!(Response::StatusOk.to_bytes(), b"\x1b[0n");
        assert_eq!(Response::CursorPosition(3, 12).to_bytes(), b"\x1b[3;12R");
    }

    #[test]
    fn test_beep_respects_sound_setting() {
        let mut screen = screen(80, 24);
        screen.beep();
        screen.set_sound(false);
        screen.beep();
        assert_eq!(screen.take_output(), vec![Output::Bell]);
    }

    #[test]
    fn test_scrollback_budget() {
        let mut screen = ScreenModel::new(&ScreenConfig {
            width: 20,
            retention_chars: 100,
            hysteresis: 10,
            ..ScreenConfig::default()
        });
        for i in 0..30 {
            write(&mut screen, &format!("line {:04}", i));
            screen.new_line();
            assert!(screen.total_chars() <= 100 + 10 + 21);
            assert_eq!(screen.total_chars(), recount(&screen));
            assert_eq!(screen.cursor().line, screen.line_count() - 1);
        }
        assert!(screen.line_count() < 30);
        assert!(screen.total_chars() >= 100 - 21);
        assert_eq!(text(&screen, screen.line_count() - 2), "line 0029");
    }

    #[test]
    fn test_set_width_truncates_and_clamps() {
        let mut screen = screen(80, 24);
        write(&mut screen, "0123456789");
        screen.render_snapshot();

        screen.set_width(4);
        assert_eq!(text(&screen, 0), "0123");
        assert_eq!(screen.cursor().column, 3);
        assert_eq!(screen.total_chars(), 5);

        let snapshot = screen.render_snapshot();
        assert!(snapshot.flags.contains(SnapshotFlags::FULL_REDRAW));
        assert_eq!(snapshot.width, 4);
        assert!(screen.render_snapshot().flags.is_empty());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut screen = screen(80, 24);
        write(&mut screen, "junk");
        screen.new_line();
        screen.select_graphic_rendition(&[31], true);
        screen.clear();

        assert_eq!(screen.line_count(), 1);
        assert_eq!(screen.cursor(), CursorPosition::default());
        assert_eq!(screen.total_chars(), 1);
        screen.new_line();
        assert!(screen.line(1).open_styles().is_empty());
    }
}
