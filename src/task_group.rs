//! Bounded fan-out / fan-in of async tasks.
//!
//! A `TaskGroup` accepts at most `capacity` tasks, hands each one a child
//! cancellation token, and is consumed by `join`, which waits for every task
//! under a deadline. On deadline expiry or cancellation all tasks still
//! running are aborted before `join` returns.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskGroupError {
    #[error("task group is full ({capacity} tasks)")]
    Full { capacity: usize },

    #[error("task group did not finish within {0:?}")]
    Timeout(Duration),

    #[error("task group cancelled")]
    Cancelled,
}

pub struct TaskGroup<T> {
    capacity: usize,
    token: CancellationToken,
    handles: Vec<JoinHandle<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create a group whose token is a child of `parent`. Cancelling the
    /// parent cancels the group; the group never cancels the parent.
    pub fn new(capacity: usize, parent: &CancellationToken) -> Self {
        Self {
            capacity,
            token: parent.child_token(),
            handles: Vec::with_capacity(capacity),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawn a task onto the runtime. The closure receives the group token.
    pub fn spawn<F, Fut>(&mut self, task: F) -> Result<(), TaskGroupError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.handles.len() >= self.capacity {
            return Err(TaskGroupError::Full { capacity: self.capacity });
        }
        self.handles.push(tokio::spawn(task(self.token.clone())));
        Ok(())
    }

    /// Wait for every task. Results come back in spawn order.
    pub async fn join(self, deadline: Duration) -> Result<Vec<Result<T, JoinError>>, TaskGroupError> {
        let aborts: Vec<AbortHandle> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let token = self.token;

        let outcome = tokio::select! {
            joined = tokio::time::timeout(deadline, join_all(self.handles)) => {
                joined.map_err(|_| TaskGroupError::Timeout(deadline))
            }
            _ = token.cancelled() => Err(TaskGroupError::Cancelled),
        };

        if outcome.is_err() {
            token.cancel();
            for handle in aborts {
                handle.abort();
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_join_collects_in_spawn_order() {
        let parent = CancellationToken::new();
        let mut group = TaskGroup::new(3, &parent);
        for i in 0..3u64 {
            group
                .spawn(move |_| async move {
                    tokio::time::sleep(Duration::from_millis(30 - i * 10)).await;
                    i
                })
                .unwrap();
        }

        let results = group.join(Duration::from_secs(5)).await.unwrap();
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_spawn_beyond_capacity() {
        let parent = CancellationToken::new();
        let mut group = TaskGroup::new(1, &parent);
        group.spawn(|_| async {}).unwrap();
        assert_eq!(group.spawn(|_| async {}), Err(TaskGroupError::Full { capacity: 1 }));
        assert_eq!(group.len(), 1);
        group.join(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_cancels_and_aborts() {
        let parent = CancellationToken::new();
        let mut group = TaskGroup::new(2, &parent);
        let token = group.token();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        group
            .spawn(move |_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let err = group.join(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, TaskGroupError::Timeout(Duration::from_millis(20)));
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_tasks() {
        let parent = CancellationToken::new();
        let mut group = TaskGroup::new(1, &parent);
        group
            .spawn(|token| async move {
                token.cancelled().await;
            })
            .unwrap();

        parent.cancel();
        let err = group.join(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, TaskGroupError::Cancelled);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let parent = CancellationToken::new();
        let mut group: TaskGroup<u8> = TaskGroup::new(2, &parent);
        group.spawn(|_| async { 1 }).unwrap();
        group.spawn(|_| async { panic!("boom") }).unwrap();

        let results = group.join(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(results[1].as_ref().unwrap_err().is_panic());
    }
}
