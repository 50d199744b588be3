//! Escape sequence interpreter
//!
//! Byte-at-a-time state machine for the CSI subset serial devices commonly
//! emit. Bytes are decoded as ISO-8859-1. Sequences it does not understand
//! are written to the screen as visible text (`^[[99Q`) so the user can see
//! what the device sent.

use super::screen::ScreenModel;

/// Glyph shown for control characters that are not handled
pub const PLACEHOLDER: char = '\u{2E2E}';

const MAX_DIGITS: usize = 4;
const MAX_PARAMS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterpreterState {
    #[default]
    Idle,
    SawEscape,
    SawEscapeBracket,
}

pub struct EscapeInterpreter {
    state: InterpreterState,
    digits: String,
    params: Vec<i32>,
    /// Parameter text of the sequence in progress, echoed when unrecognized
    raw: String,
    drop_unrecognized_ctrl_chars: bool,
}

impl Default for EscapeInterpreter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EscapeInterpreter {
    pub fn new(drop_unrecognized_ctrl_chars: bool) -> Self {
        Self {
            state: InterpreterState::Idle,
            digits: String::with_capacity(MAX_DIGITS),
            params: Vec::with_capacity(MAX_PARAMS + 1),
            raw: String::new(),
            drop_unrecognized_ctrl_chars,
        }
    }

    pub fn state(&self) -> InterpreterState {
        self.state
    }

    pub fn set_drop_unrecognized_ctrl_chars(&mut self, drop: bool) {
        self.drop_unrecognized_ctrl_chars = drop;
    }

    /// Abandon any sequence in progress
    pub fn reset(&mut self) {
        self.state = InterpreterState::Idle;
        self.digits.clear();
        self.params.clear();
        self.raw.clear();
    }

    pub fn feed_all(&mut self, bytes: &[u8], replayed: bool, screen: &mut ScreenModel) {
        for &byte in bytes {
            self.feed(byte, replayed, screen);
        }
    }

    /// Feed a single byte. `replayed` marks bytes that were already
    /// interpreted once; they never produce device status replies or bells.
    pub fn feed(&mut self, byte: u8, replayed: bool, screen: &mut ScreenModel) {
        let c = char::from(byte);
        match self.state {
            InterpreterState::Idle => self.idle(c, replayed, screen),
            InterpreterState::SawEscape => self.escape(c, replayed, screen),
            InterpreterState::SawEscapeBracket => self.csi(c, replayed, screen),
        }
    }

    fn idle(&mut self, c: char, replayed: bool, screen: &mut ScreenModel) {
        if c >= ' ' {
            screen.put_printable(c);
        } else {
            self.control(c, replayed, screen);
        }
    }

    fn control(&mut self, c: char, replayed: bool, screen: &mut ScreenModel) {
        match c {
            '\x1b' => self.state = InterpreterState::SawEscape,
            '\n' => screen.new_line(),
            '\x08' => screen.backspace(),
            '\r' => screen.carriage_return(),
            '\t' => screen.tab(),
            '\x07' => {
                if !replayed {
                    screen.beep();
                }
            }
            _ => {
                if !self.drop_unrecognized_ctrl_chars {
                    screen.put_printable(PLACEHOLDER);
                }
            }
        }
    }

    fn escape(&mut self, c: char, replayed: bool, screen: &mut ScreenModel) {
        match c {
            '[' => {
                self.state = InterpreterState::SawEscapeBracket;
                self.digits.clear();
                self.params.clear();
                self.raw.clear();
            }
            'H' => {
                self.state = InterpreterState::Idle;
                screen.position_cursor_in_window(1, 1);
            }
            _ => {
                self.state = InterpreterState::Idle;
                echo(screen, "^[");
                self.idle(c, replayed, screen);
            }
        }
    }

    fn accepts_digit(&self, c: char) -> bool {
        (c.is_ascii_digit() || (c == '-' && self.digits.is_empty()))
            && self.digits.len() < MAX_DIGITS
    }

    fn take_number(&mut self) -> i32 {
        if self.digits.is_empty() {
            return 0;
        }
        // A leading '-' is accepted into the buffer but never a valid number
        let value = match self.digits.parse::<u16>() {
            Ok(value) => i32::from(value),
            Err(_) => {
                tracing::warn!("Malformed numeric parameter {:?}", self.digits);
                0
            }
        };
        self.digits.clear();
        value
    }

    fn csi(&mut self, c: char, replayed: bool, screen: &mut ScreenModel) {
        if self.accepts_digit(c) {
            self.digits.push(c);
            self.raw.push(c);
            return;
        }

        let n = self.take_number();
        let count = n.max(1) as usize;
        let mut keep_params = false;
        self.state = InterpreterState::Idle;

        match c {
            'A' => screen.cursor_up(count),
            'B' => screen.cursor_down(count),
            'C' => screen.cursor_forward(count),
            'D' => screen.cursor_backward(count),
            'G' => screen.cursor_to_column(count - 1),
            'H' => {
                self.params.push(n);
                match self.params[..] {
                    [row] => screen.position_cursor_in_window(row, 1),
                    [row, column] => screen.position_cursor_in_window(row, column),
                    _ => tracing::warn!(
                        "Cursor position with {} parameters",
                        self.params.len()
                    ),
                }
            }
            'J' => screen.erase_display(n),
            'K' => screen.erase_line(n),
            ';' => {
                self.params.push(n);
                if self.params.len() > MAX_PARAMS {
                    tracing::warn!("Too many CSI parameters, sequence discarded");
                } else {
                    keep_params = true;
                    self.raw.push(';');
                    self.state = InterpreterState::SawEscapeBracket;
                }
            }
            'm' => {
                self.params.push(n);
                screen.select_graphic_rendition(&self.params, true);
            }
            'n' => {
                if !replayed {
                    screen.device_status_report(n);
                }
            }
            _ => {
                tracing::debug!("Unrecognized CSI sequence {:?} {:?}", self.raw, c);
                echo(screen, "^[[");
                echo(screen, &self.raw);
                if c >= ' ' {
                    screen.put_printable(c);
                } else {
                    self.control(c, replayed, screen);
                }
            }
        }

        if !keep_params {
            self.params.clear();
            self.raw.clear();
        }
    }
}

fn echo(screen: &mut ScreenModel, text: &str) {
    for c in text.chars() {
        screen.put_printable(c);
    }
}
