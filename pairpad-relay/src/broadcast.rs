//! Per-connection outbound queues with a supersede-on-overflow policy.
//!
//! The relay never writes to a socket directly. Each connection owns an
//! [`Outbox`]; fan-out pushes into it without blocking and the connection's
//! own task drains it at whatever pace the socket allows.
//!
//! ```text
//!              push (never blocks)           recv (per-connection task)
//! Relay ──┬──► Outbox[A] [ joined | delta | chat ] ──► socket A
//!         ├──► Outbox[B] [ delta ]                 ──► socket B
//!         └──► Outbox[C] closed → Delivery::Dropped
//! ```
//!
//! Overflow policy once a queue holds `capacity` events:
//! - the oldest queued buffer snapshot is evicted when a newer snapshot is
//!   queued or arriving, since that one carries the whole document;
//! - chat and presence events are never evicted; if no snapshot is queued
//!   they are appended past `capacity`, and so is a lone snapshot;
//! - at `hard_limit` the queue closes and the connection is torn down.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::presence::ConnectionId;
use crate::protocol::ServerEvent;

/// Per-recipient outcome of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to the recipient's queue.
    Queued,
    /// Appended after evicting an older buffer snapshot.
    Superseded,
    /// Not delivered: the recipient's queue is closed.
    Dropped,
}

#[derive(Debug)]
struct OutboxState {
    queue: VecDeque<Arc<ServerEvent>>,
    closed: bool,
}

/// Bounded, non-blocking send queue for one connection.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    closed_signal: Notify,
    capacity: usize,
    hard_limit: usize,
}

impl Outbox {
    /// Create a queue that starts superseding snapshots at `capacity` and
    /// closes at four times that.
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, capacity.saturating_mul(4))
    }

    pub fn with_limits(capacity: usize, hard_limit: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            closed_signal: Notify::new(),
            capacity,
            hard_limit: hard_limit.max(capacity),
        }
    }

    fn state(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event without blocking.
    pub fn push(&self, event: Arc<ServerEvent>) -> Delivery {
        let mut state = self.state();
        if state.closed {
            return Delivery::Dropped;
        }

        let mut delivery = Delivery::Queued;
        if state.queue.len() >= self.capacity {
            if let Some(stale) = stale_snapshot(&state.queue, &event) {
                state.queue.remove(stale);
                delivery = Delivery::Superseded;
            } else if state.queue.len() >= self.hard_limit {
                state.closed = true;
                state.queue.clear();
                drop(state);
                self.signal_closed();
                return Delivery::Dropped;
            }
        }

        state.queue.push_back(event);
        drop(state);
        self.notify.notify_one();
        delivery
    }

    /// Wait for the next event. Returns `None` once the queue is closed.
    pub async fn recv(&self) -> Option<Arc<ServerEvent>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
            }
            notified.await;
        }
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&self) -> Option<Arc<ServerEvent>> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        state.queue.pop_front()
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<Arc<ServerEvent>> {
        self.state().queue.drain(..).collect()
    }

    /// Close the queue; pending events are discarded and `recv` returns `None`.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.queue.clear();
        }
        self.signal_closed();
    }

    fn signal_closed(&self) {
        self.notify.notify_one();
        self.closed_signal.notify_waiters();
    }

    /// Resolve once the queue is closed, whether by [`Outbox::close`] or by
    /// passing the hard limit. Does not consume events.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Index of the oldest queued snapshot, provided a newer one is queued or
/// arriving. The latest snapshot is never evicted.
fn stale_snapshot(queue: &VecDeque<Arc<ServerEvent>>, incoming: &ServerEvent) -> Option<usize> {
    let mut snapshots = queue
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_superseded_by_newer())
        .map(|(i, _)| i);
    let oldest = snapshots.next()?;
    if incoming.is_superseded_by_newer() || snapshots.next().is_some() {
        Some(oldest)
    } else {
        None
    }
}

/// Per-recipient delivery results of one relay operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fanout {
    pub deliveries: Vec<(ConnectionId, Delivery)>,
}

impl Fanout {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn record(&mut self, recipient: ConnectionId, delivery: Delivery) {
        self.deliveries.push((recipient, delivery));
    }

    pub fn extend(&mut self, other: Fanout) {
        self.deliveries.extend(other.deliveries);
    }

    /// Recipients in delivery order.
    pub fn recipients(&self) -> Vec<ConnectionId> {
        self.deliveries.iter().map(|(id, _)| *id).collect()
    }

    pub fn reached(&self, id: &ConnectionId) -> bool {
        self.deliveries
            .iter()
            .any(|(to, d)| to == id && *d != Delivery::Dropped)
    }

    pub fn count(&self, delivery: Delivery) -> usize {
        self.deliveries.iter().filter(|(_, d)| *d == delivery).count()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}
