//! Delivery dispatcher: finished notifications -> consumer.
//!
//! - Producers (diff worker, seed path) push() and notify(); they never wait for
//!   the consumer. The delivery queue has its own lock, separate from the work queue.
//! - The consumer drains on its own thread: drain() hands queued notifications to
//!   the target one at a time until the queue is empty or delivery is paused.
//! - pause() only delays delivery; resume() drains synchronously.
//! - close() discards whatever is queued; later pushes are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::metrics::{record_notification_delivered, record_notification_enqueued, record_notifications_discarded};
use crate::notification::ChangeNotification;
use crate::signal::EventLoopSignal;

/// Receives delivered notifications, on the thread that drains.
pub type DeliverFn = Arc<dyn Fn(ChangeNotification) + Send + Sync + 'static>;

pub struct DeliveryDispatcher {
    queue: Mutex<VecDeque<ChangeNotification>>,
    paused: AtomicBool,
    closed: AtomicBool,
    signal: Arc<EventLoopSignal>,
    deliver: DeliverFn,
}

impl DeliveryDispatcher {
    pub fn new(deliver: DeliverFn) -> Self {
        Self::with_signal(deliver, Arc::new(EventLoopSignal::new()))
    }

    pub fn with_signal(deliver: DeliverFn, signal: Arc<EventLoopSignal>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            signal,
            deliver,
        }
    }

    pub fn signal(&self) -> &Arc<EventLoopSignal> {
        &self.signal
    }

    /// Queue a notification (no wake). Returns false if the dispatcher is closed.
    pub fn push(&self, change: ChangeNotification) -> bool {
        let mut q = self.queue.lock().unwrap();
        // checked under the queue lock so close() cannot miss a racing push
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        record_notification_enqueued(change.is_initial());
        q.push_back(change);
        true
    }

    /// Wake the consumer's context. Coalesces with earlier unconsumed wakes.
    pub fn notify(&self) {
        self.signal.notify();
    }

    pub fn push_and_notify(&self, change: ChangeNotification) -> bool {
        let pushed = self.push(change);
        if pushed {
            self.notify();
        }
        pushed
    }

    /// Deliver queued notifications until empty or paused. Returns the number delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0usize;
        while !self.paused.load(Ordering::Acquire) {
            let next = {
                let mut q = self.queue.lock().unwrap();
                if self.closed.load(Ordering::Acquire) {
                    break;
                }
                q.pop_front()
            };
            let Some(change) = next else { break };
            record_notification_delivered();
            (self.deliver)(change);
            delivered += 1;
        }
        delivered
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Clear the pause flag and catch up synchronously.
    pub fn resume(&self) -> usize {
        self.paused.store(false, Ordering::Release);
        self.drain()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Stop delivering: discard queued notifications, refuse new ones.
    pub fn close(&self) -> usize {
        let mut q = self.queue.lock().unwrap();
        self.closed.store(true, Ordering::Release);
        let n = q.len();
        q.clear();
        if n > 0 {
            debug!("dispatcher closed, {} undelivered notification(s) discarded", n);
            record_notifications_discarded(n);
        }
        n
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
