//! Debounced snapshot publishing
//!
//! Renderers should not see one snapshot per received byte. A [`Publisher`]
//! coalesces bursts of [`Publisher::request`] calls into at most one publish
//! per interval, run on its own worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Publisher {
    /// A publish is waiting for its interval to elapse
    scheduled: Arc<AtomicBool>,
    /// Requests arrived while one was already scheduled
    owed: Arc<AtomicBool>,
    kick: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Start the worker. `publish` receives `true` when more than one request
    /// was folded into this publish.
    pub fn spawn<F>(interval: Duration, mut publish: F) -> Self
    where
        F: FnMut(bool) + Send + 'static,
    {
        let scheduled = Arc::new(AtomicBool::new(false));
        let owed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<()>();

        let worker = {
            let scheduled = scheduled.clone();
            let owed = owed.clone();
            thread::spawn(move || {
                while rx.recv().is_ok() {
                    match rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    scheduled.store(false, Ordering::SeqCst);
                    publish(owed.swap(false, Ordering::SeqCst));
                }
                tracing::debug!("Publisher stopped");
            })
        };

        Self {
            scheduled,
            owed,
            kick: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Ask for a publish within one interval
    pub fn request(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            self.owed.store(true, Ordering::SeqCst);
            return;
        }
        let kick = self.kick.lock().unwrap_or_else(PoisonError::into_inner);
        match kick.as_ref() {
            Some(tx) if tx.send(()).is_ok() => {}
            _ => self.scheduled.store(false, Ordering::SeqCst),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Stop the worker. A publish that is still waiting is dropped.
    pub fn stop(&self) {
        self.kick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                tracing::error!("Publisher thread panicked");
            }
        }
        self.scheduled.store(false, Ordering::SeqCst);
        self.owed.store(false, Ordering::SeqCst);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}
