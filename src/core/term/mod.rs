//! Terminal emulation: rows, the screen buffer and the escape interpreter

pub mod line;
pub mod parser;
pub mod screen;

pub use line::{LineBuffer, LineOverflow, Rgb, Span, Style, StyledLine};
pub use parser::{EscapeInterpreter, InterpreterState};
pub use screen::{CursorPosition, Output, Response, ScreenModel, ScreenSnapshot, SnapshotFlags};
