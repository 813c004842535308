//! Start/stop bookkeeping shared by both slashers.

use parking_lot::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Where a slasher is in its lifecycle.
///
/// Transitions only move forward, except that a failed start returns to
/// [`LifecycleState::NotStarted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, never started.
    NotStarted,

    /// `start` is loading parameters and subscribing.
    Starting,

    /// Workers are running.
    Running,

    /// Stopped for good.
    Stopped,
}

/// The state latch, the quit signal and the completion barrier of one slasher.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::NotStarted),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Claims the start. Returns `false` if the slasher was started or stopped before.
    pub(crate) fn begin_start(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::NotStarted => {
                *state = LifecycleState::Starting;
                true
            }
            _ => false,
        }
    }

    /// Releases a claimed start after a startup failure.
    pub(crate) fn abort_start(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Starting {
            *state = LifecycleState::NotStarted;
        }
    }

    /// Spawns the workers and enters [`LifecycleState::Running`].
    ///
    /// `spawn` runs under the state lock so a concurrent stop either sees no workers at all or
    /// waits for all of them. Returns `false`, without calling `spawn`, if a stop won the race.
    pub(crate) fn commit_start(
        &self,
        spawn: impl FnOnce(&TaskTracker, &CancellationToken),
    ) -> bool {
        let mut state = self.state.lock();
        if *state != LifecycleState::Starting {
            return false;
        }

        spawn(&self.tasks, &self.cancel);
        *state = LifecycleState::Running;
        true
    }

    /// Enters [`LifecycleState::Stopped`] and returns the state it left, or `None` if it was
    /// already stopped.
    pub(crate) fn begin_stop(&self) -> Option<LifecycleState> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Stopped => None,
            prev => {
                *state = LifecycleState::Stopped;
                Some(prev)
            }
        }
    }

    /// Signals every worker to quit and waits until all tracked tasks have exited.
    ///
    /// Safe to call any number of times, also concurrently.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Resolves once the quit signal has been given.
    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
