use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use log::debug;

/// Broadcast queue: every subscriber gets its own copy of each item.
///
/// `publish` holds a single lock for the whole delivery, so consumers never
/// observe an item that other consumers have not been offered yet.
#[derive(Debug)]
pub struct FanOut<T> {
    senders: Mutex<Vec<Sender<T>>>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> FanOut<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<T>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `item` to every live subscriber; returns how many received it.
    pub fn publish(&self, item: T) -> usize {
        let mut senders = self.lock();
        let before = senders.len();
        senders.retain(|tx| tx.send(item.clone()).is_ok());
        if senders.len() < before {
            debug!("Dropped {} disconnected subscribers", before - senders.len());
        }
        senders.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every sender so receivers drain and then disconnect.
    pub fn close(&self) {
        self.lock().clear();
    }
}
