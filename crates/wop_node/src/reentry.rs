//! Inject reentrancy guard.
//!
//! A process-wide count of sessions currently servicing an `inject`. The
//! engine enters a session before invoking the handler and leaves it on
//! every return path; `send_inject` refuses to dial out for a session that
//! is currently being serviced, which stops two mutually-addressed agents
//! from deadlocking each other.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Default)]
pub struct InjectGuard {
    active: Mutex<HashMap<String, usize>>,
}

impl InjectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a session as servicing an inject. The returned slot releases
    /// the mark when dropped, covering error paths for free.
    pub fn enter<'a>(&'a self, session: &str) -> InjectSlot<'a> {
        *self.active.lock().entry(session.to_string()).or_insert(0) += 1;
        InjectSlot {
            guard: self,
            session: session.to_string(),
        }
    }

    pub fn is_active(&self, session: &str) -> bool {
        self.active.lock().contains_key(session)
    }

    fn exit(&self, session: &str) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(session) {
            *count -= 1;
            if *count == 0 {
                active.remove(session);
            }
        }
    }
}

pub struct InjectSlot<'a> {
    guard: &'a InjectGuard,
    session: String,
}

impl Drop for InjectSlot<'_> {
    fn drop(&mut self) {
        self.guard.exit(&self.session);
    }
}
