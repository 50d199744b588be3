//! Session management
//!
//! A [`Session`] owns one packet store and keeps a terminal screen and a hex
//! view in sync with it. A consumer thread reads new packets and feeds them to
//! the views; a [`Publisher`] republishes snapshots for renderers at most once
//! per interval.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use super::hex::{HexBlock, HexView};
use super::publish::Publisher;
use super::store::{DataAvailable, Direction, PacketChunk, PacketStore, StreamCursor};
use super::term::{EscapeInterpreter, Output, ScreenModel, ScreenSnapshot};
use crate::config::Config;

/// Longest the consumer sleeps without a store notification
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The device side of a session
pub trait Host: Send + Sync {
    /// Write bytes to the device
    fn send_bytes(&self, bytes: &[u8]) -> io::Result<()>;

    /// Audible bell. Failures are logged and otherwise ignored.
    fn beep(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Host for read-only sessions; replies go nowhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    fn send_bytes(&self, _bytes: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

struct OwnedChunk {
    bytes: Vec<u8>,
    serial: u64,
    offset: usize,
    direction: Direction,
    timestamp: SystemTime,
}

impl OwnedChunk {
    fn new(chunk: &PacketChunk<'_>) -> Self {
        Self {
            bytes: chunk.bytes.to_vec(),
            serial: chunk.serial,
            offset: chunk.offset,
            direction: chunk.direction,
            timestamp: chunk.timestamp,
        }
    }

    fn end(&self) -> StreamCursor {
        StreamCursor::new(self.serial, self.offset + self.bytes.len())
    }
}

/// Everything the consumer mutates, behind one lock
struct Terminal {
    screen: ScreenModel,
    interpreter: EscapeInterpreter,
    hex: HexView,
    /// Next unread position in the store
    cursor: StreamCursor,
    /// Bytes below this were interpreted before
    high_water: StreamCursor,
}

impl Terminal {
    fn feed(&mut self, chunk: &OwnedChunk) {
        self.hex.on_data(&chunk.bytes, chunk.direction, chunk.timestamp);
        if chunk.direction == Direction::In {
            for (i, &byte) in chunk.bytes.iter().enumerate() {
                let position = StreamCursor::new(chunk.serial, chunk.offset + i);
                let replayed = position < self.high_water;
                self.interpreter.feed(byte, replayed, &mut self.screen);
            }
            self.screen.request_scroll_to_bottom();
        }
        self.high_water = self.high_water.max(chunk.end());
    }

    fn reset_views(&mut self) {
        self.screen.clear();
        self.interpreter.reset();
        self.hex.clear();
    }
}

struct Published {
    snapshot: Arc<ScreenSnapshot>,
    hex: Arc<Vec<HexBlock>>,
    listeners: Vec<Sender<()>>,
}

struct Shared {
    store: Arc<PacketStore>,
    host: Box<dyn Host>,
    /// Held for a whole read-feed-dispatch round; the terminal read position
    /// only moves under it
    pump: Mutex<()>,
    terminal: Mutex<Terminal>,
    published: Mutex<Published>,
    running: AtomicBool,
}

impl Shared {
    fn terminal(&self) -> MutexGuard<'_, Terminal> {
        self.terminal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn published(&self) -> MutexGuard<'_, Published> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pump_guard(&self) -> MutexGuard<'_, ()> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pump(&self) -> bool {
        let _pump = self.pump_guard();
        self.pump_locked()
    }

    /// Feed everything the terminal has not seen yet. Returns whether
    /// anything was fed.
    ///
    /// Chunks are copied out under the store lock and fed under the terminal
    /// lock; the two are never held together. The read position is committed
    /// after every chunk, so a stop between chunks loses nothing.
    fn pump_locked(&self) -> bool {
        let start = self.terminal().cursor;
        let mut chunks = Vec::new();
        let end = match self.store.read(start, |chunk| chunks.push(OwnedChunk::new(chunk))) {
            Ok(end) => end,
            Err(e) => {
                tracing::error!("Consumer read failed: {}", e);
                return false;
            }
        };

        let outputs = {
            let mut terminal = self.terminal();
            if chunks.is_empty() {
                terminal.cursor = end;
                return false;
            }
            for chunk in &chunks {
                if !self.running.load(Ordering::SeqCst) {
                    tracing::debug!("Stopped with {:?} committed", terminal.cursor);
                    break;
                }
                terminal.feed(chunk);
                terminal.cursor = chunk.end();
            }
            terminal.screen.take_output()
        };
        self.dispatch(outputs);
        true
    }

    fn dispatch(&self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Reply(response) => {
                    let bytes = response.to_bytes();
                    match self.host.send_bytes(&bytes) {
                        Ok(()) => self.store.append(&bytes, Direction::Out),
                        Err(e) => tracing::warn!("Failed to send {:?}: {}", response, e),
                    }
                }
                Output::Bell => {
                    if let Err(e) = self.host.beep() {
                        tracing::warn!("beep() failed: {}", e);
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let (snapshot, hex) = {
            let mut terminal = self.terminal();
            (
                Arc::new(terminal.screen.render_snapshot()),
                Arc::new(terminal.hex.blocks()),
            )
        };
        let mut published = self.published();
        published.snapshot = snapshot;
        published.hex = hex;
        published.listeners.retain(|tx| tx.send(()).is_ok());
    }
}

/// One serial stream: store, screen, hex view and their threads
pub struct Session {
    shared: Arc<Shared>,
    publisher: Arc<Publisher>,
    consumer: Option<JoinHandle<()>>,
}

impl Session {
    /// Create the session and start its consumer and publisher threads
    pub fn new(config: &Config, host: impl Host + 'static) -> Self {
        let store = Arc::new(PacketStore::new(&config.store));
        let notifications = store.subscribe();

        let mut screen = ScreenModel::new(&config.screen);
        let initial = Arc::new(screen.render_snapshot());
        let shared = Arc::new(Shared {
            store,
            host: Box::new(host),
            pump: Mutex::new(()),
            terminal: Mutex::new(Terminal {
                screen,
                interpreter: EscapeInterpreter::new(config.screen.drop_unrecognized_ctrl_chars),
                hex: HexView::new(&config.hex),
                cursor: StreamCursor::default(),
                high_water: StreamCursor::default(),
            }),
            published: Mutex::new(Published {
                snapshot: initial,
                hex: Arc::new(Vec::new()),
                listeners: Vec::new(),
            }),
            running: AtomicBool::new(true),
        });

        let publisher = {
            let shared = shared.clone();
            Arc::new(Publisher::spawn(config.ui.publish_interval(), move |owed| {
                if owed {
                    tracing::trace!("Publishing coalesced updates");
                }
                shared.publish();
            }))
        };

        let consumer = {
            let shared = shared.clone();
            let publisher = publisher.clone();
            thread::spawn(move || consume(&shared, &publisher, &notifications))
        };

        tracing::info!(
            "Session started: {}x{}, {} bytes of history",
            config.screen.width,
            config.screen.height,
            config.store.retention_bytes
        );

        Self {
            shared,
            publisher,
            consumer: Some(consumer),
        }
    }

    pub fn store(&self) -> &Arc<PacketStore> {
        &self.shared.store
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Record bytes travelling in `direction`
    pub fn append(&self, bytes: &[u8], direction: Direction) {
        self.shared.store.append(bytes, direction);
    }

    /// The producer has no more data for now
    pub fn input_idle(&self) {
        self.shared.store.input_idle();
    }

    pub fn totals(&self) -> (usize, usize) {
        self.shared.store.totals()
    }

    pub fn current_cursor(&self) -> StreamCursor {
        self.shared.store.current_cursor()
    }

    /// Latest published screen snapshot
    pub fn snapshot(&self) -> Arc<ScreenSnapshot> {
        self.shared.published().snapshot.clone()
    }

    /// Latest published hex blocks
    pub fn hex_blocks(&self) -> Arc<Vec<HexBlock>> {
        self.shared.published().hex.clone()
    }

    /// Channel pinged after every publish
    pub fn subscribe_published(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.shared.published().listeners.push(tx);
        rx
    }

    pub fn set_dimensions(&self, width: u16, height: u16) {
        self.shared.terminal().screen.set_dimensions(width, height);
        self.publisher.request();
    }

    pub fn set_retention_budget(&self, bytes: usize) {
        self.shared.store.set_retention_budget(bytes);
    }

    pub fn set_screen_retention(&self, chars: usize) {
        self.shared.terminal().screen.set_retention_chars(chars);
        self.publisher.request();
    }

    pub fn set_hex_retention(&self, chars: usize) {
        self.shared.terminal().hex.set_retention_chars(chars);
        self.publisher.request();
    }

    pub fn set_sound(&self, sound: bool) {
        self.shared.terminal().screen.set_sound(sound);
    }

    /// Clear the screen and hex view. With `erase_history` the stored
    /// packets go too; otherwise they stay available to [`Session::redraw`].
    pub fn clear(&self, erase_history: bool) {
        {
            let _pump = self.shared.pump_guard();
            if erase_history {
                self.shared.store.clear();
            }
            let cursor = self.shared.store.current_cursor();
            let mut terminal = self.shared.terminal();
            terminal.reset_views();
            terminal.cursor = cursor;
            terminal.high_water = terminal.high_water.max(cursor);
        }
        tracing::info!("Cleared (history erased: {})", erase_history);
        self.publisher.request();
    }

    /// Rebuild the views from the whole retained history.
    ///
    /// Replayed bytes never send device status replies again.
    pub fn redraw(&self) {
        {
            let _pump = self.shared.pump_guard();
            {
                let mut terminal = self.shared.terminal();
                terminal.reset_views();
                terminal.cursor = StreamCursor::default();
            }
            tracing::debug!("Redrawing from retained history");
            self.shared.pump_locked();
        }
        self.shared.publish();
    }

    /// Feed everything currently in the store on the calling thread and
    /// publish at once
    pub fn sync(&self) {
        self.shared.pump();
        self.shared.publish();
    }

    /// Stop the consumer and publisher threads
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.consumer.take() {
            if handle.join().is_err() {
                tracing::error!("Consumer thread panicked");
            }
            self.publisher.stop();
            tracing::info!("Session stopped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume(shared: &Shared, publisher: &Publisher, notifications: &Receiver<DataAvailable>) {
    while shared.running.load(Ordering::SeqCst) {
        match notifications.recv_timeout(POLL_INTERVAL) {
            Ok(DataAvailable) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.pump() {
            publisher.request();
        }
    }
    tracing::debug!("Consumer stopped");
}
