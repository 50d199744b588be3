//! Printing snapshots with crossterm
//!
//! Writes the final screen (with span colors) or the hex view to any writer.

use std::io::{self, Write};

use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};

use serterm::core::hex::HexBlock;
use serterm::core::store::Direction;
use serterm::core::term::{Rgb, ScreenSnapshot, Style, StyledLine};

/// Foreground color of every character of `line`; later spans win
fn char_colors(line: &StyledLine) -> Vec<Option<Rgb>> {
    let mut colors = vec![None; line.char_len()];
    for span in &line.spans {
        let Style::Foreground(rgb) = span.style;
        let end = span.end.min(colors.len());
        for color in colors.iter_mut().take(end).skip(span.start) {
            *color = Some(rgb);
        }
    }
    colors
}

fn print_line<W: Write>(out: &mut W, line: &StyledLine, color: bool) -> io::Result<()> {
    if !color {
        return writeln!(out, "{}", line.text);
    }
    let colors = char_colors(line);
    let mut current = None;
    let mut run = String::new();
    for (c, rgb) in line.text.chars().zip(colors) {
        if rgb != current && !run.is_empty() {
            print_run(out, &run, current)?;
            run.clear();
        }
        current = rgb;
        run.push(c);
    }
    if !run.is_empty() {
        print_run(out, &run, current)?;
    }
    queue!(out, Print("\n"))
}

fn print_run<W: Write>(out: &mut W, text: &str, rgb: Option<Rgb>) -> io::Result<()> {
    match rgb {
        Some(rgb) => queue!(
            out,
            SetForegroundColor(rgb.to_crossterm()),
            Print(text),
            ResetColor
        ),
        None => queue!(out, Print(text)),
    }
}

/// Print the whole buffer, or only the visible window
pub fn print_screen<W: Write>(
    out: &mut W,
    snapshot: &ScreenSnapshot,
    visible_only: bool,
    color: bool,
) -> io::Result<()> {
    let lines = if visible_only {
        snapshot.visible()
    } else {
        &snapshot.lines[..]
    };
    for line in lines {
        print_line(out, line, color)?;
    }
    out.flush()
}

/// Print hex blocks: timestamps dimmed, received data green, sent data yellow
pub fn print_hex<W: Write>(out: &mut W, blocks: &[HexBlock], color: bool) -> io::Result<()> {
    for block in blocks {
        if !color {
            write!(out, "{}{}", block.header, block.dump)?;
            continue;
        }
        let data_color = match block.direction {
            Some(Direction::Out) => Color::DarkYellow,
            _ => Color::DarkGreen,
        };
        queue!(
            out,
            SetAttribute(Attribute::Dim),
            Print(&block.header),
            SetAttribute(Attribute::Reset),
            SetForegroundColor(data_color),
            Print(&block.dump),
            ResetColor
        )?;
    }
    out.flush()
}
