use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    UserSpeaking,
    AgentSpeaking,
}

impl Activity {
    pub fn label(self) -> &'static str {
        match self {
            Activity::Idle => "idle",
            Activity::UserSpeaking => "user_speaking",
            Activity::AgentSpeaking => "agent_speaking",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActivitySnapshot {
    pub activity: Activity,
    pub updated_at: Instant,
}

/// Shared who-is-talking indicator. Writers replace the whole snapshot
/// atomically; the last write wins.
#[derive(Clone)]
pub struct ActivitySignal {
    inner: Arc<ArcSwap<ActivitySnapshot>>,
}

impl Default for ActivitySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(ActivitySnapshot {
                activity: Activity::Idle,
                updated_at: Instant::now(),
            })),
        }
    }

    pub fn update(&self, activity: Activity) {
        trace!(activity = activity.label(), "Activity update");
        self.inner.store(Arc::new(ActivitySnapshot {
            activity,
            updated_at: Instant::now(),
        }));
    }

    /// Refresh the timestamp without changing the current state.
    pub fn touch(&self) {
        self.update(self.current());
    }

    pub fn reset(&self) {
        self.update(Activity::Idle);
    }

    pub fn current(&self) -> Activity {
        self.inner.load().activity
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        **self.inner.load()
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.load().updated_at.elapsed()
    }
}
