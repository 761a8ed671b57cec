use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::core::OnlineState;
use crate::error::FirestoreError;
use crate::util::{lock, AsyncQueue, DelayedOperation, TimerId};

/// Watch stream failures tolerated before the client reports offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    online_state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the client's [`OnlineState`] from watch stream activity.
///
/// A fresh connection attempt is `Unknown` until the stream delivers data
/// (`Online`) or fails / times out (`Offline`). One failure is tolerated so
/// a single dropped connection does not flip cached snapshots.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    timeout: Duration,
    handler: OnlineStateHandler,
    state: Mutex<TrackerState>,
    this: Weak<Self>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, handler: OnlineStateHandler) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue,
            timeout,
            handler,
            state: Mutex::new(TrackerState {
                online_state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            }),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> OnlineState {
        lock(&self.state).online_state
    }

    /// A watch stream is starting; goes offline if it does not connect in time.
    pub fn handle_watch_stream_start(&self) {
        let changed = {
            let mut state = lock(&self.state);
            if state.watch_stream_failures != 0 {
                return;
            }
            let changed = Self::transition(&mut state, OnlineState::Unknown);
            let this = self.this.clone();
            state.online_state_timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                self.timeout,
                move || async move {
                    if let Some(tracker) = this.upgrade() {
                        tracker.on_timeout();
                    }
                },
            ));
            changed
        };
        self.broadcast(changed);
    }

    fn on_timeout(&self) {
        let changed = {
            let mut state = lock(&self.state);
            state.online_state_timer = None;
            if state.online_state != OnlineState::Unknown {
                return;
            }
            Self::log_client_offline_warning(
                &mut state,
                &format!("Backend didn't respond within {} seconds.", self.timeout.as_secs()),
            );
            Self::transition(&mut state, OnlineState::Offline)
        };
        self.broadcast(changed);
    }

    /// Records a watch stream failure. A connected stream only drops back to
    /// `Unknown`; repeated failures while connecting report `Offline`.
    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        let changed = {
            let mut state = lock(&self.state);
            if state.online_state == OnlineState::Online {
                Self::transition(&mut state, OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
                    return;
                }
                if let Some(timer) = state.online_state_timer.take() {
                    timer.cancel();
                }
                let reason = match error {
                    Some(error) => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"),
                    None => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times."),
                };
                Self::log_client_offline_warning(&mut state, &reason);
                Self::transition(&mut state, OnlineState::Offline)
            }
        };
        self.broadcast(changed);
    }

    /// Sets the state explicitly and resets failure tracking.
    pub fn set(&self, online_state: OnlineState) {
        let changed = {
            let mut state = lock(&self.state);
            if let Some(timer) = state.online_state_timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if online_state == OnlineState::Online {
                // Once online, later outages are expected and not worth a warning.
                state.should_warn_client_is_offline = false;
            }
            Self::transition(&mut state, online_state)
        };
        self.broadcast(changed);
    }

    fn transition(state: &mut TrackerState, online_state: OnlineState) -> Option<OnlineState> {
        if state.online_state == online_state {
            return None;
        }
        state.online_state = online_state;
        Some(online_state)
    }

    fn broadcast(&self, changed: Option<OnlineState>) {
        if let Some(online_state) = changed {
            (self.handler)(online_state);
        }
    }

    fn log_client_offline_warning(state: &mut TrackerState, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode until it can reach the backend."
        );
        if state.should_warn_client_is_offline {
            log::warn!("{message}");
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}
