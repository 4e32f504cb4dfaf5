//! Notification fan-out: one `Notifier` per notification kind.
//!
//! Subscribers get an unbounded receiver and observe values in emission order.
//! Dropping the receiver unsubscribes; closed receivers are pruned on the next emit.

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct Notifier<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Notifier<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, value: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl<T: Clone> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}
