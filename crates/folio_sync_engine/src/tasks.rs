//! Owned background task tracking.

use std::future::Future;
use tokio::task::JoinHandle;

/// A set of spawned tasks that die with their owner.
///
/// Every pending remote call, storage call, and backoff timer in the engine
/// runs as a task registered here; dropping the set aborts them all, which
/// is what makes owner destruction deterministic. No completion event from
/// an aborted task is ever delivered.
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    /// Creates an empty set.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawns a task owned by this set.
    pub(crate) fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.retain(|handle| !handle.is_finished());
        self.handles.push(tokio::spawn(future));
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn dropping_the_set_aborts_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let mut tasks = TaskSet::new();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });
        drop(tasks);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
