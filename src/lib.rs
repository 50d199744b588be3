//! serterm - serial terminal core
//!
//! The pieces a serial terminal needs between the device and the renderer:
//!
//! - **core::store**: bounded, serial-numbered packet history with independent
//!   cursor-based readers
//! - **core::term**: a VT100-subset interpreter driving a scrollback screen
//! - **core::hex**: timestamped hex view of the same traffic
//! - **core::session**: threads tying the store to the views, with debounced
//!   snapshot publishing
//! - **config**: TOML configuration for every budget and interval

pub mod config;
pub mod core;

pub use crate::config::Config;
pub use crate::core::session::{Host, NullHost, Session};
pub use crate::core::store::{Direction, PacketStore, StreamCursor};
