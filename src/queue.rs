//! Lock-free command rings between the control plane and the real-time
//! thread.
//!
//! A [`CommandSender`] pushes from any control-plane thread; the
//! real-time side drains with [`CommandReceiver::drain`] once per block.
//! Pushing is wait-free while the ring has space and falls back to
//! briefly spinning back-pressure when it is full, so a burst of scene
//! changes never reaches the audio thread mid-block.

use std::thread;
use std::time::Duration;
use thingbuf::mpsc::blocking::{channel, Receiver, Sender};

/// Default ring capacity, plenty for one block's worth of scene changes.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Producer half of a command ring.
#[derive(Clone)]
pub struct CommandSender<T> {
    sender: Sender<T>,
}

/// Consumer half of a command ring.
pub struct CommandReceiver<T> {
    receiver: Receiver<T>,
}

/// Create a bounded command ring.
pub fn command_ring<T: Clone + Default>(capacity: usize) -> (CommandSender<T>, CommandReceiver<T>) {
    let (sender, receiver) = channel(capacity);
    (CommandSender { sender }, CommandReceiver { receiver })
}

impl<T: Clone + Default> CommandSender<T> {
    /// Push without blocking. Returns the value back if the ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.sender.try_send(value).map_err(|e| e.into_inner())
    }

    /// Push, applying back-pressure if the ring is full. Returns `false`
    /// if the consumer is gone or the ring stays full for a long time.
    pub fn push(&self, value: T) -> bool {
        let mut value = value;
        for _ in 0..1000 {
            match self.sender.try_send(value) {
                Ok(()) => return true,
                Err(thingbuf::mpsc::errors::TrySendError::Full(v)) => {
                    value = v;
                    thread::sleep(Duration::from_micros(100));
                }
                Err(_) => return false,
            }
        }
        false
    }
}

impl<T: Clone + Default> CommandReceiver<T> {
    /// Take one queued value, if any. Never blocks.
    pub fn try_pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything currently queued. Never blocks.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain { receiver: self }
    }
}

/// Iterator over queued values; ends when the ring is momentarily empty.
pub struct Drain<'a, T> {
    receiver: &'a CommandReceiver<T>,
}

impl<T: Clone + Default> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.try_pop()
    }
}
