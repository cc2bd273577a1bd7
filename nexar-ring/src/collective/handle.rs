use crate::error::{Result, RingError};
use tokio::task::JoinHandle;

enum State {
    Running(JoinHandle<Result<Vec<u8>>>),
    Failed(RingError),
    Consumed,
}

/// A handle to a non-blocking reduce-scatter.
///
/// The collective runs on tokio's blocking pool. Call `wait()` to get the
/// received bytes, or check `is_finished()` to poll.
///
/// Dropping the handle detaches the collective: it still runs to completion,
/// so peers waiting on this rank's flags are never left hanging.
pub struct CollectiveHandle {
    state: State,
}

impl CollectiveHandle {
    /// Run a blocking collective on the runtime's blocking pool.
    pub(crate) fn spawn_blocking(
        runtime: &tokio::runtime::Handle,
        f: impl FnOnce() -> Result<Vec<u8>> + Send + 'static,
    ) -> Self {
        Self {
            state: State::Running(runtime.spawn_blocking(f)),
        }
    }

    /// A handle whose collective was rejected before it started.
    pub(crate) fn failed(err: RingError) -> Self {
        Self {
            state: State::Failed(err),
        }
    }

    /// Wait for the collective to complete and return this rank's output.
    pub async fn wait(mut self) -> Result<Vec<u8>> {
        match std::mem::replace(&mut self.state, State::Consumed) {
            State::Running(handle) => handle.await.map_err(|e| {
                RingError::device_with_source("reduce-scatter task panicked", e)
            })?,
            State::Failed(e) => Err(e),
            State::Consumed => Err(RingError::Internal(
                "collective handle already consumed".into(),
            )),
        }
    }

    /// Check if the collective has finished (non-blocking).
    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Running(h) => h.is_finished(),
            State::Failed(_) | State::Consumed => true,
        }
    }
}

impl std::fmt::Debug for CollectiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Running(_) => "running",
            State::Failed(_) => "failed",
            State::Consumed => "consumed",
        };
        f.debug_struct("CollectiveHandle")
            .field("state", &state)
            .finish()
    }
}

/// A group of non-blocking collectives that can be waited on together.
#[derive(Debug, Default)]
pub struct CollectiveGroup {
    handles: Vec<CollectiveHandle>,
}

impl CollectiveGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle to the group.
    pub fn push(&mut self, h: CollectiveHandle) {
        self.handles.push(h);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for all collectives in the group, returning outputs in push
    /// order.
    ///
    /// Returns the first error encountered, if any. All tasks are awaited
    /// regardless of errors.
    pub async fn wait_all(self) -> Result<Vec<Vec<u8>>> {
        let mut outputs = Vec::with_capacity(self.handles.len());
        let mut first_err = None;
        for h in self.handles {
            match h.wait().await {
                Ok(out) => outputs.push(out),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }
}
