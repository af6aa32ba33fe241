//! Delivery channel between the polling thread and a consumer.
//!
//! Readings are latest-wins: a reading still queued when the next one
//! arrives is replaced, so a slow display only ever sees fresh data. State
//! changes are never coalesced or dropped, and nothing is reordered.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;
use thiserror::Error;

use crate::engine::ConnectionState;
use crate::reading::Reading;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Reading(Reading),
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("no event within the timeout")]
    Timeout,
    #[error("all senders are gone")]
    Closed,
}

struct Queue {
    events: VecDeque<Event>,
    capacity: usize,
    senders: usize,
    /// Readings replaced before the consumer saw them.
    overwritten: u64,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A panic while holding the lock cannot leave a half-written event.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a channel bounded at `capacity` pending events.
///
/// When full, the oldest pending reading is dropped to make room. State
/// events are exempt from the bound: with no reading left to evict they are
/// queued anyway, so a consumer that never drains while sessions keep being
/// opened and closed sees the queue grow by two events per session.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            events: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            senders: 1,
            overwritten: 0,
        }),
        ready: Condvar::new(),
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    pub fn publish_reading(&self, reading: Reading) {
        let mut queue = self.shared.lock();
        if let Some(Event::Reading(pending)) = queue.events.back_mut() {
            trace!("overwriting undelivered reading #{}", pending.sequence);
            *pending = reading;
            queue.overwritten += 1;
        } else {
            if queue.events.len() >= queue.capacity {
                if let Some(pos) = queue.events.iter().position(|e| matches!(e, Event::Reading(_))) {
                    queue.events.remove(pos);
                    queue.overwritten += 1;
                }
            }
            queue.events.push_back(Event::Reading(reading));
        }
        drop(queue);
        self.shared.ready.notify_all();
    }

    pub fn publish_state(&self, old: ConnectionState, new: ConnectionState) {
        let mut queue = self.shared.lock();
        if queue.events.len() >= queue.capacity {
            if let Some(pos) = queue.events.iter().position(|e| matches!(e, Event::Reading(_))) {
                queue.events.remove(pos);
                queue.overwritten += 1;
            }
        }
        queue.events.push_back(Event::StateChanged { old, new });
        drop(queue);
        self.shared.ready.notify_all();
    }
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        let mut queue = self.shared.lock();
        queue.senders -= 1;
        let closed = queue.senders == 0;
        drop(queue);
        if closed {
            self.shared.ready.notify_all();
        }
    }
}

/// Consumer side. Clones share the same queue; each event is delivered once.
#[derive(Clone)]
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    pub fn try_recv(&self) -> Option<Event> {
        self.shared.lock().events.pop_front()
    }

    /// Block until an event arrives or every sender is dropped.
    pub fn recv(&self) -> Result<Event, RecvError> {
        let mut queue = self.shared.lock();
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Ok(event);
            }
            if queue.senders == 0 {
                return Err(RecvError::Closed);
            }
            queue = self
                .shared
                .ready
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.lock();
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Ok(event);
            }
            if queue.senders == 0 {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            queue = self
                .shared
                .ready
                .wait_timeout(queue, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Take everything pending, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        self.shared.lock().events.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().events.len()
    }

    /// Readings that were replaced before being received.
    pub fn overwritten(&self) -> u64 {
        self.shared.lock().overwritten
    }
}
