//! Hex view
//!
//! Raw dump of the stream, grouped into blocks. A block collects the bytes of
//! one direction that share a packet timestamp, up to [`MAX_BLOCK_BYTES`], and
//! renders them as a timestamp header plus a 16-bytes-per-row hex dump.

use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use super::store::Direction;
use super::term::line::next_version;
use crate::config::HexConfig;

/// A block holding this many bytes is closed and a new one started
pub const MAX_BLOCK_BYTES: usize = 1024;

const BYTES_PER_ROW: usize = 16;

/// Snapshot of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBlock {
    /// Changes whenever the block's text changes
    pub id: u64,
    /// `None` only for the placeholder shown before any data arrived
    pub direction: Option<Direction>,
    pub timestamp: Option<SystemTime>,
    /// `"\nHH:MM:SS.mmm\n"`
    pub header: Arc<str>,
    pub dump: Arc<str>,
}

impl HexBlock {
    fn placeholder() -> Self {
        Self {
            id: next_version(),
            direction: None,
            timestamp: None,
            header: Arc::from(""),
            dump: Arc::from(""),
        }
    }

    pub fn char_len(&self) -> usize {
        self.header.len() + self.dump.len()
    }
}

pub struct HexView {
    blocks: VecDeque<HexBlock>,
    /// Bytes of the newest block
    pending: Vec<u8>,
    total_chars: usize,
    retention_chars: usize,
    hysteresis: usize,
}

impl Default for HexView {
    fn default() -> Self {
        Self::new(&HexConfig::default())
    }
}

impl HexView {
    pub fn new(config: &HexConfig) -> Self {
        let mut blocks = VecDeque::new();
        blocks.push_back(HexBlock::placeholder());
        Self {
            blocks,
            pending: Vec::with_capacity(MAX_BLOCK_BYTES),
            total_chars: 0,
            retention_chars: config.retention_chars,
            hysteresis: config.hysteresis,
        }
    }

    pub fn on_data(&mut self, bytes: &[u8], direction: Direction, timestamp: SystemTime) {
        if bytes.is_empty() {
            return;
        }
        let Some(last) = self.blocks.back_mut() else {
            return;
        };
        if last.direction.is_none() {
            last.direction = Some(direction);
            last.timestamp = Some(timestamp);
        } else if last.timestamp != Some(timestamp)
            || last.direction != Some(direction)
            || self.pending.len() >= MAX_BLOCK_BYTES
        {
            self.pending.clear();
            let mut block = HexBlock::placeholder();
            block.direction = Some(direction);
            block.timestamp = Some(timestamp);
            self.blocks.push_back(block);
        }

        self.pending.extend_from_slice(bytes);
        self.render_last();
        self.trim();
    }

    fn render_last(&mut self) {
        let dump = hex_dump(&self.pending);
        let Some(last) = self.blocks.back_mut() else {
            return;
        };
        self.total_chars -= last.char_len();
        if let Some(timestamp) = last.timestamp {
            last.header = Arc::from(format_header(timestamp));
        }
        last.dump = Arc::from(dump);
        last.id = next_version();
        self.total_chars += last.char_len();
    }

    fn trim(&mut self) {
        if self.total_chars <= self.retention_chars + self.hysteresis {
            return;
        }
        while self.blocks.len() > 1 {
            let first = self.blocks[0].char_len();
            if self.total_chars - first <= self.retention_chars {
                break;
            }
            self.blocks.pop_front();
            self.total_chars -= first;
        }
        tracing::debug!(
            "Hex view trimmed to {} chars in {} blocks",
            self.total_chars,
            self.blocks.len()
        );
    }

    pub fn blocks(&self) -> Vec<HexBlock> {
        self.blocks.iter().cloned().collect()
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn set_retention_chars(&mut self, chars: usize) {
        self.retention_chars = chars;
        self.trim();
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.blocks.push_back(HexBlock::placeholder());
        self.pending.clear();
        self.total_chars = 0;
    }
}

fn format_header(timestamp: SystemTime) -> String {
    let local: DateTime<Local> = timestamp.into();
    format!("\n{}\n", local.format("%H:%M:%S%.3f"))
}

/// `OOOO  XX XX .. XX  |ascii|` rows, non-printables shown as `.`
pub fn hex_dump(bytes: &[u8]) -> String {
    let rows = (bytes.len() + BYTES_PER_ROW - 1) / BYTES_PER_ROW;
    let mut out = String::with_capacity(rows * (7 + BYTES_PER_ROW * 4 + 4));
    for (row, chunk) in bytes.chunks(BYTES_PER_ROW).enumerate() {
        let _ = write!(out, "{:04X} ", row * BYTES_PER_ROW);
        for slot in 0..BYTES_PER_ROW {
            match chunk.get(slot) {
                Some(byte) => {
                    let _ = write!(out, " {:02X}", byte);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if (0x20..0x7F).contains(&b) {
                char::from(b)
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}
