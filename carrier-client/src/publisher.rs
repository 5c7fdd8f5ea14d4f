//! Value fan-out with optional replay.
//!
//! A [`Publisher`] pushes each published value to every live subscriber.
//! When marked persistent it also hands the most recent value to anyone who
//! subscribes later, so state observers never miss the current state.

use std::sync::Mutex;

use tokio::sync::mpsc;

pub struct Publisher<T: Clone + Send + 'static> {
    inner: Mutex<Inner<T>>,
    persistent: bool,
}

struct Inner<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    last: Option<T>,
}

impl<T: Clone + Send + 'static> Publisher<T> {
    /// A publisher that only delivers values published after subscription.
    pub fn new() -> Self {
        Self::with_persistence(false)
    }

    /// A publisher that additionally replays the latest value to new
    /// subscribers.
    pub fn persistent() -> Self {
        Self::with_persistence(true)
    }

    fn with_persistence(persistent: bool) -> Self {
        Self {
            inner: Mutex::new(Inner { subscribers: Vec::new(), last: None }),
            persistent,
        }
    }

    /// The most recent value, if persistent and anything was published.
    pub fn current(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).last.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.persistent {
            if let Some(last) = &inner.last {
                let _ = tx.send(last.clone());
            }
        }
        inner.subscribers.push(tx);
        rx
    }

    /// Publish a value to all live subscribers, pruning closed ones.
    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        if self.persistent {
            inner.last = Some(value);
        }
    }
}

impl<T: Clone + Send + 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}
