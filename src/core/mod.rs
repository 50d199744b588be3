//! Core serial terminal components.
//!
//! - **store**: append-only packet history shared by all consumers
//! - **term**: line buffers, screen model and escape sequence interpreter
//! - **hex**: hex dump view of the raw traffic
//! - **publish**: debounced snapshot publishing
//! - **session**: high-level session combining the store and its views
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── PacketStore (packets + cursors, own lock)
//! ├── Terminal (own lock, fed by the consumer thread)
//! │   ├── EscapeInterpreter
//! │   ├── ScreenModel (LineBuffers + cursor)
//! │   └── HexView
//! └── Publisher (snapshot debounce thread)
//! ```

pub mod hex;
pub mod publish;
pub mod session;
pub mod store;
pub mod term;
