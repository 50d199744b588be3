//! Packet store
//!
//! Append-only history of the serial byte stream, chunked into serial-numbered
//! packets. Any number of consumers read it independently, each through its
//! own [`StreamCursor`]. History is bounded: the oldest packets are evicted
//! once the retained size passes the budget plus a hysteresis band.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

use crate::config::StoreConfig;

/// Direction of data on the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received from the device
    In,
    /// Sent to the device
    Out,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The caller holds a cursor past everything the store ever produced
    #[error("cursor at packet {cursor} is ahead of the newest packet {newest}")]
    CursorAhead { cursor: u64, newest: u64 },
}

/// Read position of one consumer: packet serial number + offset in packet.
///
/// Ordered lexically by `(serial, offset)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamCursor {
    pub serial: u64,
    pub offset: usize,
}

impl StreamCursor {
    pub const fn new(serial: u64, offset: usize) -> Self {
        Self { serial, offset }
    }
}

/// The unseen part of one packet, handed to a reader
#[derive(Debug, Clone, Copy)]
pub struct PacketChunk<'a> {
    pub bytes: &'a [u8],
    pub serial: u64,
    /// Offset of `bytes[0]` within the packet
    pub offset: usize,
    pub direction: Direction,
    pub timestamp: SystemTime,
}

impl PacketChunk<'_> {
    /// Cursor positioned just after this chunk
    pub fn end(&self) -> StreamCursor {
        StreamCursor::new(self.serial, self.offset + self.bytes.len())
    }
}

/// Notification sent to subscribers when new data is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAvailable;

struct Packet {
    serial: u64,
    direction: Direction,
    timestamp: SystemTime,
    started: Instant,
    data: Vec<u8>,
}

struct StoreInner {
    packets: VecDeque<Packet>,
    /// Serial number the next packet will get; never reset
    next_serial: u64,
    bytes_in: usize,
    bytes_out: usize,
    retention: usize,
    dirty: bool,
    appends_since_notify: u32,
    subscribers: Vec<Sender<DataAvailable>>,
}

impl StoreInner {
    fn total(&self) -> usize {
        self.bytes_in + self.bytes_out
    }

    fn last_serial(&self) -> u64 {
        self.next_serial - 1
    }

    fn start_packet(&mut self, direction: Direction, now: Instant, timestamp: SystemTime, capacity: usize) {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.packets.push_back(Packet {
            serial,
            direction,
            timestamp,
            started: now,
            data: Vec::with_capacity(capacity),
        });
    }

    /// Evict oldest packets while the total is at or above `bound`
    fn trim(&mut self, bound: usize) {
        let before = self.packets.len();
        while self.total() >= bound {
            let Some(oldest) = self.packets.pop_front() else {
                break;
            };
            match oldest.direction {
                Direction::In => self.bytes_in -= oldest.data.len(),
                Direction::Out => self.bytes_out -= oldest.data.len(),
            }
        }
        let evicted = before - self.packets.len();
        if evicted > 0 {
            tracing::debug!(
                "Evicted {} packets, {} bytes retained in {} packets",
                evicted,
                self.total(),
                self.packets.len()
            );
        }
    }

    fn notify(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.subscribers.retain(|tx| tx.send(DataAvailable).is_ok());
    }

    fn current_cursor(&self) -> StreamCursor {
        StreamCursor::new(
            self.last_serial(),
            self.packets.back().map_or(0, |p| p.data.len()),
        )
    }
}

/// Shared, lock-protected packet history
pub struct PacketStore {
    max_packet_size: usize,
    max_packet_duration: Duration,
    hysteresis: usize,
    notify_every: u32,
    inner: Mutex<StoreInner>,
}

impl Default for PacketStore {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

impl PacketStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size.max(1),
            max_packet_duration: config.max_packet_duration(),
            hysteresis: config.hysteresis,
            notify_every: config.notify_every.max(1),
            inner: Mutex::new(StoreInner {
                packets: VecDeque::new(),
                next_serial: 1,
                bytes_in: 0,
                bytes_out: 0,
                retention: config.retention_bytes,
                dirty: false,
                appends_since_notify: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register for "new data available" notifications
    pub fn subscribe(&self) -> Receiver<DataAvailable> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Append bytes travelling in `direction`
    pub fn append(&self, bytes: &[u8], direction: Direction) {
        self.append_at(bytes, direction, Instant::now(), SystemTime::now());
    }

    fn append_at(&self, bytes: &[u8], direction: Direction, now: Instant, timestamp: SystemTime) {
        if bytes.is_empty() {
            return;
        }
        let max = self.max_packet_size;
        let mut guard = self.lock();
        let inner = &mut *guard;

        let start_new = match inner.packets.back() {
            None => true,
            Some(last) => {
                last.direction != direction
                    || now.saturating_duration_since(last.started) >= self.max_packet_duration
            }
        };
        if start_new {
            inner.start_packet(direction, now, timestamp, max);
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let full = inner.packets.back().map_or(true, |p| p.data.len() >= max);
            if full {
                inner.start_packet(direction, now, timestamp, max);
            }
            let Some(current) = inner.packets.back_mut() else {
                break;
            };
            let take = (max - current.data.len()).min(rest.len());
            current.data.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }

        match direction {
            Direction::In => inner.bytes_in += bytes.len(),
            Direction::Out => inner.bytes_out += bytes.len(),
        }
        inner.trim(inner.retention + self.hysteresis);

        inner.dirty = true;
        inner.appends_since_notify += 1;
        if inner.appends_since_notify >= self.notify_every {
            inner.appends_since_notify = 0;
            inner.notify();
        }
    }

    /// Flush point: the producer has no more data for now
    pub fn input_idle(&self) {
        let mut inner = self.lock();
        inner.appends_since_notify = 0;
        inner.notify();
    }

    /// Visit every byte after `cursor`, one call per packet, and return the
    /// cursor positioned after the newest byte.
    ///
    /// A cursor older than the retention window is moved to the oldest
    /// retained packet.
    pub fn read<F>(&self, cursor: StreamCursor, mut visit: F) -> Result<StreamCursor, StoreError>
    where
        F: FnMut(&PacketChunk<'_>),
    {
        let inner = self.lock();
        let newest = inner.last_serial();
        if cursor.serial > newest {
            tracing::error!(
                "read() with cursor {:?} ahead of newest packet {}",
                cursor,
                newest
            );
            return Err(StoreError::CursorAhead {
                cursor: cursor.serial,
                newest,
            });
        }
        let Some(first) = inner.packets.front() else {
            return Ok(cursor);
        };

        let start = if cursor.serial < first.serial {
            StreamCursor::new(first.serial, 0)
        } else {
            cursor
        };
        let skip = (start.serial - first.serial) as usize;

        let mut result = cursor;
        for packet in inner.packets.iter().skip(skip) {
            let offset = if packet.serial == start.serial { start.offset } else { 0 };
            if packet.data.len() > offset {
                visit(&PacketChunk {
                    bytes: &packet.data[offset..],
                    serial: packet.serial,
                    offset,
                    direction: packet.direction,
                    timestamp: packet.timestamp,
                });
            }
            result = result.max(StreamCursor::new(packet.serial, packet.data.len()));
        }
        Ok(result)
    }

    /// Change the retention budget, trimming at once if it shrank
    pub fn set_retention_budget(&self, bytes: usize) {
        let mut inner = self.lock();
        let shrank = bytes < inner.retention;
        inner.retention = bytes;
        if shrank {
            let bound = bytes + self.hysteresis;
            inner.trim(bound);
        }
    }

    pub fn retention_budget(&self) -> usize {
        self.lock().retention
    }

    /// Evict oldest packets until below budget + hysteresis
    pub fn trim(&self) {
        let mut inner = self.lock();
        let bound = inner.retention + self.hysteresis;
        inner.trim(bound);
    }

    /// Drop all history. Serial numbers keep counting up.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.packets.clear();
        inner.bytes_in = 0;
        inner.bytes_out = 0;
        inner.dirty = false;
        inner.appends_since_notify = 0;
    }

    /// Retained bytes per direction: (in, out)
    pub fn totals(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.bytes_in, inner.bytes_out)
    }

    /// Cursor positioned after the newest byte
    pub fn current_cursor(&self) -> StreamCursor {
        self.lock().current_cursor()
    }

    /// Serial numbers of the oldest and newest retained packets
    pub fn serial_range(&self) -> Option<(u64, u64)> {
        let inner = self.lock();
        Some((inner.packets.front()?.serial, inner.packets.back()?.serial))
    }

    pub fn packet_count(&self) -> usize {
        self.lock().packets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store(retention: usize) -> PacketStore {
        PacketStore::new(&StoreConfig {
            retention_bytes: retention,
            max_packet_size: 16,
            hysteresis: 10,
            ..StoreConfig::default()
        })
    }

    fn collect(store: &PacketStore, cursor: StreamCursor) -> (Vec<u8>, Vec<u64>, StreamCursor) {
        let mut bytes = Vec::new();
        let mut serials = Vec::new();
        let next = store
            .read(cursor, |chunk| {
                bytes.extend_from_slice(chunk.bytes);
                serials.push(chunk.serial);
            })
            .unwrap();
        (bytes, serials, next)
    }

    #[test]
    fn test_append_coalesces_same_direction() {
        let store = PacketStore::default();
        store.append(b"hello ", Direction::In);
        store.append(b"world", Direction::In);

        assert_eq!(store.packet_count(), 1);
        assert_eq!(store.totals(), (11, 0));
        assert_eq!(store.current_cursor(), StreamCursor::new(1, 11));
    }

    #[test]
    fn test_direction_change_starts_packet() {
        let store = PacketStore::default();
        store.append(b"AT\r", Direction::Out);
        store.append(b"OK\r\n", Direction::In);
        store.append(b"AT+GMR\r", Direction::Out);

        assert_eq!(store.serial_range(), Some((1, 3)));
        assert_eq!(store.totals(), (4, 10));
    }

    #[test]
    fn test_time_gap_starts_packet() {
        let store = PacketStore::default();
        let t0 = Instant::now();
        let wall = SystemTime::now();
        store.append_at(b"a", Direction::In, t0, wall);
        store.append_at(b"b", Direction::In, t0 + Duration::from_millis(1999), wall);
        assert_eq!(store.packet_count(), 1);

        store.append_at(b"c", Direction::In, t0 + Duration::from_millis(2000), wall);
        assert_eq!(store.packet_count(), 2);
    }

    #[test]
    fn test_large_append_splits_into_full_packets() {
        let store = small_store(1000);
        let data: Vec<u8> = (0..40).collect();
        store.append(&data, Direction::In);

        assert_eq!(store.packet_count(), 3);
        let (bytes, serials, next) = collect(&store, StreamCursor::default());
        assert_eq!(bytes, data);
        assert_eq!(serials, vec![1, 2, 3]);
        assert_eq!(next, StreamCursor::new(3, 8));
    }

    #[test]
    fn test_read_is_idempotent() {
        let store = PacketStore::default();
        store.append(b"abc", Direction::In);

        let (first, _, cursor) = collect(&store, StreamCursor::default());
        assert_eq!(first, b"abc");

        let (second, serials, again) = collect(&store, cursor);
        assert!(second.is_empty());
        assert!(serials.is_empty());
        assert_eq!(again, cursor);
    }

    #[test]
    fn test_read_visits_only_unseen_bytes() {
        let store = PacketStore::default();
        store.append(b"abc", Direction::In);
        let (_, _, cursor) = collect(&store, StreamCursor::default());

        store.append(b"def", Direction::In);
        store.append(b"xyz", Direction::Out);

        let mut chunks = Vec::new();
        let next = store
            .read(cursor, |chunk| {
                chunks.push((chunk.bytes.to_vec(), chunk.offset, chunk.direction))
            })
            .unwrap();

        assert_eq!(
            chunks,
            vec![
                (b"def".to_vec(), 3, Direction::In),
                (b"xyz".to_vec(), 0, Direction::Out),
            ]
        );
        assert_eq!(next, StreamCursor::new(2, 3));
        assert!(next >= cursor);
    }

    #[test]
    fn test_stale_cursor_is_clamped_to_oldest() {
        let store = small_store(32);
        for i in 0..20u8 {
            store.append(&[i; 16], Direction::In);
        }
        let (oldest, _) = store.serial_range().unwrap();
        assert!(oldest > 1);

        let mut first_visit = None;
        let next = store
            .read(StreamCursor::new(1, 5), |chunk| {
                first_visit.get_or_insert((chunk.serial, chunk.offset));
            })
            .unwrap();
        assert_eq!(first_visit, Some((oldest, 0)));
        assert_eq!(next, store.current_cursor());
    }

    #[test]
    fn test_cursor_ahead_is_an_error() {
        let store = PacketStore::default();
        store.append(b"abc", Direction::In);

        let err = store.read(StreamCursor::new(7, 0), |_| {}).unwrap_err();
        assert_eq!(err, StoreError::CursorAhead { cursor: 7, newest: 1 });
    }

    #[test]
    fn test_empty_store_returns_cursor_unchanged() {
        let store = PacketStore::default();
        let next = store.read(StreamCursor::default(), |_| panic!("no data")).unwrap();
        assert_eq!(next, StreamCursor::default());
    }

    #[test]
    fn test_budget_invariant_under_load() {
        let store = PacketStore::new(&StoreConfig {
            retention_bytes: 5000,
            ..StoreConfig::default()
        });
        let mut previous = 0;
        for i in 0..2000usize {
            let direction = if i % 7 == 0 { Direction::Out } else { Direction::In };
            let chunk = vec![b'x'; 1 + (i * 37) % 300];
            store.append(&chunk, direction);

            let (bytes_in, bytes_out) = store.totals();
            let total = bytes_in + bytes_out;
            assert!(total <= 5000 + 1000, "total {} over bound", total);
            if total < previous {
                assert!(total >= 5000 - 1000, "trimmed too far: {}", total);
            }
            previous = total;
        }
    }

    #[test]
    fn test_eviction_is_fifo_and_gapless() {
        let store = small_store(64);
        let mut last_range = (0, 0);
        for i in 0..50u8 {
            let direction = if i % 2 == 0 { Direction::In } else { Direction::Out };
            store.append(&[i; 9], direction);

            let (oldest, newest) = store.serial_range().unwrap();
            assert!(oldest >= last_range.0);
            assert!(newest >= last_range.1);
            assert_eq!((newest - oldest + 1) as usize, store.packet_count());
            last_range = (oldest, newest);
        }

        let (_, serials, _) = collect(&store, StreamCursor::default());
        assert!(serials.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_clear_keeps_serials_monotonic() {
        let store = PacketStore::default();
        store.append(b"before", Direction::In);
        let (_, _, stale) = collect(&store, StreamCursor::default());

        store.clear();
        assert_eq!(store.totals(), (0, 0));
        assert_eq!(store.read(stale, |_| panic!("no data")).unwrap(), stale);

        store.append(b"after", Direction::In);
        assert_eq!(store.serial_range(), Some((2, 2)));

        let (bytes, _, next) = collect(&store, stale);
        assert_eq!(bytes, b"after");
        assert_eq!(next, StreamCursor::new(2, 5));
    }

    #[test]
    fn test_notify_every_fourth_append() {
        let store = PacketStore::default();
        let rx = store.subscribe();

        for _ in 0..3 {
            store.append(b"x", Direction::In);
        }
        assert!(rx.try_recv().is_err());

        store.append(b"x", Direction::In);
        assert_eq!(rx.try_recv(), Ok(DataAvailable));
        assert!(rx.try_recv().is_err());

        for _ in 0..8 {
            store.append(b"x", Direction::In);
        }
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_input_idle_notifies_once() {
        let store = PacketStore::default();
        let rx = store.subscribe();

        store.append(b"x", Direction::In);
        store.input_idle();
        store.input_idle();
        assert_eq!(rx.try_iter().count(), 1);

        store.input_idle();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let store = PacketStore::default();
        let rx = store.subscribe();
        drop(rx);
        let live = store.subscribe();

        store.append(b"x", Direction::In);
        store.input_idle();
        assert_eq!(live.try_iter().count(), 1);
        assert_eq!(store.lock().subscribers.len(), 1);
    }

    #[test]
    fn test_lower_retention_budget_trims_immediately() {
        let store = PacketStore::default();
        for i in 0..40u8 {
            let direction = if i % 2 == 0 { Direction::In } else { Direction::Out };
            store.append(&[i; 500], direction);
        }
        assert_eq!(store.totals(), (10_000, 10_000));

        store.set_retention_budget(4000);
        let (bytes_in, bytes_out) = store.totals();
        assert!(bytes_in + bytes_out < 5000);
        assert!(bytes_in + bytes_out >= 3000);
        assert_eq!(store.retention_budget(), 4000);
    }
}
