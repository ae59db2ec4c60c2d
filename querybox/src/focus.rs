//! Application focus tracking.
//!
//! Hosts report focus changes with [`FocusManager::set_focused`]; observers
//! with `refetch_on_window_focus` subscribe and refetch stale entries when
//! focus comes back.

use tokio::sync::watch;
use tracing::debug;

/// Focus flag plus the number of times focus was regained, so that a quick
/// blur and refocus is not lost to a receiver that only sees the last value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusState {
    /// Whether the application currently has focus.
    pub focused: bool,
    /// Number of `false -> true` transitions so far.
    pub regained: u64,
}

/// Shared focus flag. Starts focused.
#[derive(Debug, Clone)]
pub struct FocusManager {
    state: watch::Sender<FocusState>,
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusManager {
    /// Creates a manager in the focused state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(FocusState {
            focused: true,
            regained: 0,
        });
        FocusManager { state }
    }

    /// Records a focus change. Repeating the current state notifies nobody.
    pub fn set_focused(&self, focused: bool) {
        let changed = self.state.send_if_modified(|state| {
            if state.focused == focused {
                return false;
            }
            state.focused = focused;
            if focused {
                state.regained += 1;
            }
            true
        });
        if changed {
            debug!(focused, "focus changed");
        }
    }

    /// Current focus state.
    pub fn is_focused(&self) -> bool {
        self.state.borrow().focused
    }

    /// Receiver notified on every focus change.
    pub fn subscribe(&self) -> watch::Receiver<FocusState> {
        self.state.subscribe()
    }

    /// Number of times focus was regained so far.
    pub fn regain_count(&self) -> u64 {
        self.state.borrow().regained
    }

    /// Resolves once focus was regained more than `seen` times and returns the
    /// new count, or `None` if the manager was dropped.
    pub async fn regained_since(rx: &mut watch::Receiver<FocusState>, seen: u64) -> Option<u64> {
        rx.wait_for(|state| state.regained > seen)
            .await
            .ok()
            .map(|state| state.regained)
    }
}
