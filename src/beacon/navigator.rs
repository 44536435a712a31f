//! Internal URL history for the preview frame.
//!
//! The navigator mirrors a browser history API over the beacon's frame:
//! `visit` appends (truncating any forward tail), `go_back`/`go_forward`
//! move the index, and every mutation emits `historyChange` and
//! `navigationStateChange` on the beacon bus. Child-initiated navigation
//! reaches the navigator via beacon `urlChange` pushes and is mirrored
//! into local history without re-navigating the frame.
//!
//! `can_go_forward` derives from local history only; child-side
//! navigation the SDK never saw can make it drift from the frame's real
//! history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::{now_ms, PreviewFrame};
use crate::error::SdkError;
use crate::events::EventBus;

/// Emitted on every history mutation, with `{url, direction, timestamp}`.
pub const HISTORY_CHANGE: &str = "historyChange";

/// Emitted on every history mutation, with the full navigation state.
pub const NAVIGATION_STATE_CHANGE: &str = "navigationStateChange";

struct History {
    entries: Vec<String>,
    index: Option<usize>,
}

struct NavInner {
    frame: Arc<dyn PreviewFrame>,
    bus: EventBus<serde_json::Value>,
    ready: Arc<AtomicBool>,
    state: Mutex<History>,
}

/// Navigation history bound to one preview frame.
#[derive(Clone)]
pub struct Navigator {
    inner: Arc<NavInner>,
}

impl std::fmt::Debug for Navigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Navigator")
            .field("current", &self.current_url())
            .finish_non_exhaustive()
    }
}

impl Navigator {
    pub(super) fn new(
        frame: Arc<dyn PreviewFrame>,
        bus: EventBus<serde_json::Value>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        let initial = frame.current_url();
        let (entries, index) = if initial.is_empty() {
            (Vec::new(), None)
        } else {
            (vec![initial], Some(0))
        };
        Self {
            inner: Arc::new(NavInner {
                frame,
                bus,
                ready,
                state: Mutex::new(History { entries, index }),
            }),
        }
    }

    /// Navigate to `url`, truncating any forward tail.
    ///
    /// # Errors
    ///
    /// Propagates frame navigation failures; the history entry is kept so
    /// a retry lands on the same state.
    pub fn visit(&self, url: &str) -> Result<(), SdkError> {
        {
            let mut state = self.inner.state.lock().expect("history poisoned");
            if let Some(index) = state.index {
                state.entries.truncate(index + 1);
            }
            state.entries.push(url.to_string());
            state.index = Some(state.entries.len() - 1);
        }
        // Navigation reloads the child; the ready handshake must rerun.
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.frame.navigate(url)?;
        self.emit(url, "push");
        Ok(())
    }

    /// Go one entry back. Returns `false` when already at the start.
    ///
    /// # Errors
    ///
    /// Propagates frame navigation failures.
    pub fn go_back(&self) -> Result<bool, SdkError> {
        let url = {
            let mut state = self.inner.state.lock().expect("history poisoned");
            match state.index {
                Some(index) if index > 0 => {
                    state.index = Some(index - 1);
                    state.entries[index - 1].clone()
                }
                _ => return Ok(false),
            }
        };
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.frame.navigate(&url)?;
        self.emit(&url, "back");
        Ok(true)
    }

    /// Go one entry forward. Returns `false` when at the newest entry.
    ///
    /// # Errors
    ///
    /// Propagates frame navigation failures.
    pub fn go_forward(&self) -> Result<bool, SdkError> {
        let url = {
            let mut state = self.inner.state.lock().expect("history poisoned");
            match state.index {
                Some(index) if index + 1 < state.entries.len() => {
                    state.index = Some(index + 1);
                    state.entries[index + 1].clone()
                }
                _ => return Ok(false),
            }
        };
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.frame.navigate(&url)?;
        self.emit(&url, "forward");
        Ok(true)
    }

    /// Reload the current entry.
    ///
    /// # Errors
    ///
    /// Propagates frame navigation failures; no-op without history.
    pub fn reload(&self) -> Result<(), SdkError> {
        let Some(url) = self.current_url() else { return Ok(()) };
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.frame.navigate(&url)?;
        self.emit(&url, "reload");
        Ok(())
    }

    /// Mirror a child-initiated navigation into local history.
    ///
    /// Appends like a push but does not touch the frame — the child
    /// already navigated itself.
    pub(super) fn mirror_child(&self, url: &str) {
        {
            let mut state = self.inner.state.lock().expect("history poisoned");
            if let Some(index) = state.index {
                if state.entries.get(index).map(String::as_str) == Some(url) {
                    return;
                }
                state.entries.truncate(index + 1);
            }
            state.entries.push(url.to_string());
            state.index = Some(state.entries.len() - 1);
        }
        self.emit(url, "push");
    }

    /// Whether a back entry exists.
    #[must_use]
    pub fn can_go_back(&self) -> bool {
        let state = self.inner.state.lock().expect("history poisoned");
        state.index.is_some_and(|i| i > 0)
    }

    /// Whether a forward entry exists in local history.
    #[must_use]
    pub fn can_go_forward(&self) -> bool {
        let state = self.inner.state.lock().expect("history poisoned");
        state.index.is_some_and(|i| i + 1 < state.entries.len())
    }

    /// Current history entry.
    #[must_use]
    pub fn current_url(&self) -> Option<String> {
        let state = self.inner.state.lock().expect("history poisoned");
        state.index.map(|i| state.entries[i].clone())
    }

    /// Number of history entries.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.state.lock().expect("history poisoned").entries.len()
    }

    fn emit(&self, url: &str, direction: &str) {
        let timestamp = now_ms();
        self.inner.bus.emit(
            HISTORY_CHANGE,
            &json!({ "url": url, "direction": direction, "timestamp": timestamp }),
        );
        let (can_go_back, can_go_forward, current_index, history_length) = {
            let state = self.inner.state.lock().expect("history poisoned");
            (
                state.index.is_some_and(|i| i > 0),
                state.index.is_some_and(|i| i + 1 < state.entries.len()),
                state.index.map_or(-1, |i| i as i64),
                state.entries.len(),
            )
        };
        self.inner.bus.emit(
            NAVIGATION_STATE_CHANGE,
            &json!({
                "canGoBack": can_go_back,
                "canGoForward": can_go_forward,
                "currentIndex": current_index,
                "historyLength": history_length,
                "timestamp": timestamp,
            }),
        );
    }
}
