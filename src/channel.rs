//! # Variable Capacity Channel
//!
//! Bounded hand-off queue between a runner's prefetch and execute stages whose capacity can
//! change while both sides are live.
//!
//! ## Semantics
//!
//! - `send` waits while the number of queued (accepted but not yet received) items is at or
//!   above the current capacity.
//! - `recv` takes the oldest item and wakes the oldest waiting senders, as many as the current
//!   capacity leaves room for.
//! - Raising the capacity does not wake blocked senders on its own; they are admitted at the
//!   next occupancy change. Lowering it never evicts queued items, it only stops admissions
//!   until the queue drains below the new limit.
//! - Closing the producer lets the consumer drain what is queued before it sees
//!   [`ChannelError::Closed`].
//! - Cancelling either side (or the stop signal handed to [`VariableCapacityChannel::proxy`])
//!   discards queued items and fails pending and future operations on both sides with
//!   [`ChannelError::Cancelled`].
//!
//! Capacity is a permit count consulted only when a send is admitted, with the items
//! themselves held in a plain `VecDeque`. There is no proxy task shuffling items between two
//! rendezvous channels.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::stop::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel cancelled")]
    Cancelled,
    #[error("channel capacity must be > 0, got {0}")]
    InvalidCapacity(usize),
}

type SizeListener = Box<dyn Fn(usize) + Send + Sync>;

struct State<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    senders: usize,
    waiting_senders: usize,
    closed: bool,
    cancelled: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Senders park here while the queue is at capacity.
    space: Notify,
    /// The consumer parks here while the queue is empty.
    items: Notify,
    size_listener: Option<SizeListener>,
}

impl<T> Shared<T> {
    fn notify_size(&self, queued: usize) {
        if let Some(listener) = &self.size_listener {
            listener(queued);
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.cancelled {
                return;
            }
            state.closed = true;
        }
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    fn cancel(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.buffer)
        };
        self.items.notify_waiters();
        self.space.notify_waiters();
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "Channel cancelled with queued items");
        }
        drop(dropped);
        self.notify_size(0);
    }
}

/// Resizable bounded queue; see the module docs for the exact admission rules.
pub struct VariableCapacityChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> VariableCapacityChannel<T> {
    pub fn new(capacity: usize) -> Result<Self, ChannelError> {
        Self::build(capacity, None)
    }

    /// Like [`VariableCapacityChannel::new`], calling `listener` with the queued item count
    /// every time it changes.
    pub fn with_size_listener<F>(capacity: usize, listener: F) -> Result<Self, ChannelError>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        Self::build(capacity, Some(Box::new(listener)))
    }

    fn build(capacity: usize, size_listener: Option<SizeListener>) -> Result<Self, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::InvalidCapacity(capacity));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    capacity,
                    senders: 0,
                    waiting_senders: 0,
                    closed: false,
                    cancelled: false,
                }),
                space: Notify::new(),
                items: Notify::new(),
                size_listener,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Change the capacity. Takes effect for blocked senders at the next occupancy change.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::InvalidCapacity(capacity));
        }
        self.shared.state.lock().capacity = capacity;
        Ok(())
    }

    /// Items accepted from the producer but not yet received.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Producer handle. Dropping every producer handle closes the channel.
    pub fn upstream(&self) -> ChannelSender<T> {
        self.shared.state.lock().senders += 1;
        ChannelSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Consumer handle, cancelled automatically once `stop` fires.
    pub fn proxy(&self, stop: &StopSignal) -> ChannelReceiver<T>
    where
        T: Send + 'static,
    {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let stop = stop.clone();
        tokio::spawn(async move {
            stop.stopped().await;
            if let Some(shared) = weak.upgrade() {
                shared.cancel();
            }
        });
        ChannelReceiver {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for VariableCapacityChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("VariableCapacityChannel")
            .field("capacity", &state.capacity)
            .field("queued", &state.buffer.len())
            .field("closed", &state.closed)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

pub struct ChannelSender<T> {
    shared: Arc<Shared<T>>,
}

/// Decrements the waiting-sender count however the wait ends, including the send future
/// being dropped.
struct WaitingSender<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for WaitingSender<'_, T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.waiting_senders = state.waiting_senders.saturating_sub(1);
    }
}

impl<T> ChannelSender<T> {
    /// Enqueue `item`, waiting for room under the current capacity.
    pub async fn send(&self, item: T) -> Result<(), ChannelError> {
        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.cancelled {
                    return Err(ChannelError::Cancelled);
                }
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                if state.buffer.len() < state.capacity {
                    state.buffer.push_back(item);
                    let queued = state.buffer.len();
                    drop(state);
                    self.shared.items.notify_one();
                    self.shared.notify_size(queued);
                    return Ok(());
                }
                state.waiting_senders += 1;
            }

            let _waiting = WaitingSender {
                shared: &self.shared,
            };
            notified.await;
        }
    }

    /// Signal that no more items will be sent. Queued items are still delivered.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for ChannelSender<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.state.lock();
            state.senders = state.senders.saturating_sub(1);
            state.senders == 0
        };
        if last {
            self.shared.close();
        }
    }
}

pub struct ChannelReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ChannelReceiver<T> {
    /// Take the oldest queued item. Returns [`ChannelError::Closed`] once the producer has
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Result<T, ChannelError> {
        loop {
            let notified = self.shared.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.cancelled {
                    return Err(ChannelError::Cancelled);
                }
                if let Some(item) = state.buffer.pop_front() {
                    let queued = state.buffer.len();
                    let admissible = state
                        .capacity
                        .saturating_sub(queued)
                        .min(state.waiting_senders);
                    drop(state);
                    for _ in 0..admissible {
                        self.shared.space.notify_one();
                    }
                    self.shared.notify_size(queued);
                    return Ok(item);
                }
                if state.closed {
                    return Err(ChannelError::Closed);
                }
            }

            notified.await;
        }
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl<T> Drop for ChannelReceiver<T> {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}
