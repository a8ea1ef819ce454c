use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Single-slot latest-value channel
///
/// Publishing replaces any value not yet taken. Clones share the same slot,
/// so one clone can live on a producer thread and another in the fusion loop.
/// Intended for one publisher per mailbox.
#[derive(Debug)]
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

    /// Store `value`, dropping an unread one
    ///
    /// # Returns
    /// `true` if an unread value was overwritten
    pub fn publish(&self, value: T) -> bool {
        let mut value = value;
        let mut overwritten = false;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return overwritten,
                Err(TrySendError::Full(v)) => {
                    if self.rx.try_recv().is_ok() {
                        overwritten = true;
                    }
                    value = v;
                }
                // Unreachable while we hold a receiver
                Err(TrySendError::Disconnected(_)) => return overwritten,
            }
        }
    }

    /// Take the latest value, leaving the slot empty
    pub fn take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a value
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Some(v),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Copies each published value into one mailbox per subscriber
#[derive(Debug)]
pub struct FrameFanout<T: Clone> {
    subscribers: Vec<Mailbox<T>>,
}

impl<T: Clone> Default for FrameFanout<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T: Clone> FrameFanout<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// New mailbox that receives every subsequent publish
    pub fn subscribe(&mut self) -> Mailbox<T> {
        let mailbox = Mailbox::new();
        self.subscribers.push(mailbox.clone());
        mailbox
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// # Returns
    /// Number of subscribers whose previous value was still unread
    pub fn publish(&self, value: T) -> usize {
        self.subscribers
            .iter()
            .filter(|mb| mb.publish(value.clone()))
            .count()
    }
}
