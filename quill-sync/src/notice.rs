//! Cooldown gate for connectivity notices: at most one per window.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub(crate) struct NoticeGate {
    window: Mutex<Duration>,
    last_shown: Mutex<Option<Instant>>,
}

impl NoticeGate {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window: Mutex::new(window),
            last_shown: Mutex::new(None),
        }
    }

    pub(crate) fn set_window(&self, window: Duration) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = window;
    }

    /// Returns `true` (and starts a new window) if a notice may be shown now.
    pub(crate) fn try_pass(&self) -> bool {
        let window = *self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last = self
            .last_shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(shown) if now.duration_since(shown) < window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
