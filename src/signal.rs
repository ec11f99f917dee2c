//! Cross-thread wake signal for the consumer's scheduling context.
//!
//! notify() may be called from any thread any number of times; wakes coalesce
//! until the consumer consumes them with wait(). An optional hook runs on the
//! first notify() of each batch, so a foreign event loop can be woken (post a
//! task, write to a pipe, ...) without the consumer blocking in wait().

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub type WakeHook = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
pub struct EventLoopSignal {
    pending: Mutex<bool>,
    cv: Condvar,
    hook: Mutex<Option<WakeHook>>,
}

impl EventLoopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hook(&self, hook: Option<WakeHook>) {
        *self.hook.lock().unwrap() = hook;
    }

    /// Request a wake. Returns true if this call started a new batch.
    pub fn notify(&self) -> bool {
        let first = {
            let mut p = self.pending.lock().unwrap();
            let first = !*p;
            *p = true;
            first
        };
        self.cv.notify_all();
        if first {
            let hook = self.hook.lock().unwrap().clone();
            if let Some(h) = hook {
                h();
            }
        }
        first
    }

    /// Is a wake pending (not yet consumed)?
    pub fn is_pending(&self) -> bool {
        *self.pending.lock().unwrap()
    }

    /// Consume a pending wake without blocking.
    pub fn take(&self) -> bool {
        let mut p = self.pending.lock().unwrap();
        std::mem::replace(&mut *p, false)
    }

    /// Block until a wake is pending (or the timeout passes) and consume it.
    /// `None` waits without limit. Returns false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut p = self.pending.lock().unwrap();
        while !*p {
            match deadline {
                None => p = self.cv.wait(p).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    p = self.cv.wait_timeout(p, d - now).unwrap().0;
                }
            }
        }
        *p = false;
        true
    }
}
