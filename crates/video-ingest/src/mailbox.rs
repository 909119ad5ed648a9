//! Single-slot mailbox with overwrite-on-full semantics.
//!
//! Stages with very different throughput (camera decode, JPEG encode, HTTP
//! readers) are joined through a slot that only ever holds the newest value.
//! A producer never blocks: when the slot is occupied the stale value is
//! drained and replaced. Consumers block (with a timeout) until a value is
//! present.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Capacity-1 channel that keeps only the most recent value.
pub struct Mailbox<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Store `value`, replacing any unconsumed one. Returns the value that
    /// was displaced, if any.
    pub fn put(&self, value: T) -> Option<T> {
        let mut pending = value;
        let mut displaced = None;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return displaced,
                Err(TrySendError::Full(value)) => {
                    if let Ok(stale) = self.rx.try_recv() {
                        displaced = Some(stale);
                    }
                    pending = value;
                }
                // Both ends live in `self`, so the channel cannot disconnect.
                Err(TrySendError::Disconnected(_)) => return displaced,
            }
        }
    }

    /// Take the current value without waiting.
    pub fn take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a value.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }
}
