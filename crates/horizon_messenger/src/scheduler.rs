//! Background and delayed work.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::runtime::Handle;

/// Runs the subscriber loop and conversation timeouts.
pub trait TaskScheduler: Send + Sync + 'static {
    /// Runs `task` in the background.
    fn run_async(&self, task: BoxFuture<'static, ()>);

    /// Runs `task` once after `delay`. Must not block the caller.
    fn run_after(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Tokio-backed scheduler.
///
/// Spawns onto the runtime that was current when it was created, or onto the
/// caller's runtime if it was created outside one.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    handle: Option<Handle>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        match &self.handle {
            Some(handle) => {
                handle.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn run_async(&self, task: BoxFuture<'static, ()>) {
        self.spawn(task);
    }

    fn run_after(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) {
        self.spawn(Box::pin(async move {
            tokio::time::sleep(delay).await;
            task();
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_run_async() {
        let scheduler = TokioScheduler::new();
        let (tx, rx) = oneshot::channel();
        scheduler.run_async(Box::pin(async move {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_run_after_waits() {
        let scheduler = TokioScheduler::new();
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();
        scheduler.run_after(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
