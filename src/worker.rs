//! Background task queue.
//!
//! Tasks are sent over a channel to a dispatcher that runs each one on its
//! own tokio task once a concurrency permit is free. Every attempt is bounded
//! by the queue timeout and failed attempts are retried with exponential
//! backoff until the retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

const CHANNEL_BUFFER: usize = 1024;

/// A unit of background work
#[async_trait]
pub trait BackgroundTask: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> String;

    /// Runs one attempt
    async fn run(&self) -> anyhow::Result<()>;

    /// Whether a failed attempt may be retried
    fn is_retryable(&self, _error: &anyhow::Error) -> bool {
        true
    }

    /// Called once when the last attempt failed
    async fn on_failure(&self, _error: anyhow::Error) {}
}

/// Queue limits
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub timeout: Duration,
    /// Retries after the first failed attempt
    pub retry_attempts: usize,
    pub retry_delay: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            max_concurrent: config.worker_max_concurrent.max(1),
            timeout: config.task_timeout(),
            retry_attempts: config.worker_retry_attempts,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Handle for submitting tasks to the queue
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Arc<dyn BackgroundTask>>,
    permits: Arc<Semaphore>,
    settings: QueueSettings,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("settings", &self.settings)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl TaskQueue {
    /// Spawns the dispatcher and returns a handle to it
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(settings: QueueSettings) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));

        tokio::spawn(dispatch(rx, permits.clone(), settings));
        info!(
            max_concurrent = settings.max_concurrent,
            timeout_secs = settings.timeout.as_secs(),
            "task queue started"
        );

        Self { tx, permits, settings }
    }

    /// Queues a task
    ///
    /// Fails only when the dispatcher is gone.
    pub async fn enqueue(&self, task: Arc<dyn BackgroundTask>) -> anyhow::Result<()> {
        let name = task.name();
        self.tx
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("task queue is closed, dropped {name}"))?;
        debug!("queued task {}", name);
        Ok(())
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Arc<dyn BackgroundTask>>,
    permits: Arc<Semaphore>,
    settings: QueueSettings,
) {
    while let Some(task) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        tokio::spawn(async move {
            execute(task, settings).await;
            drop(permit);
        });
    }
    debug!("task queue dispatcher stopped");
}

async fn execute(task: Arc<dyn BackgroundTask>, settings: QueueSettings) {
    let name = task.name();

    let attempt = || async {
        match tokio::time::timeout(settings.timeout, task.run()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", settings.timeout)),
        }
    };
    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_factor(2.0)
        .with_max_times(settings.retry_attempts);

    let result = attempt
        .retry(backoff)
        .when(|err| task.is_retryable(err))
        .notify(|err, delay| warn!("task {} failed, retrying in {:?}: {:#}", name, delay, err))
        .await;

    match result {
        Ok(()) => debug!("task {} finished", name),
        Err(err) => {
            error!("task {} failed: {:#}", name, err);
            task.on_failure(err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn settings(retry_attempts: usize) -> QueueSettings {
        QueueSettings {
            max_concurrent: 2,
            timeout: Duration::from_millis(200),
            retry_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    struct Flaky {
        attempts: AtomicUsize,
        succeed_on: usize,
        failures: AtomicUsize,
        done: Notify,
    }

    #[async_trait]
    impl BackgroundTask for Flaky {
        fn name(&self) -> String {
            "flaky".into()
        }

        async fn run(&self) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.succeed_on {
                self.done.notify_one();
                Ok(())
            } else {
                anyhow::bail!("attempt {attempt} failed")
            }
        }

        async fn on_failure(&self, _error: anyhow::Error) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
        }
    }

    fn flaky(succeed_on: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            attempts: AtomicUsize::new(0),
            succeed_on,
            failures: AtomicUsize::new(0),
            done: Notify::new(),
        })
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let queue = TaskQueue::start(settings(3));
        let task = flaky(3);

        queue.enqueue(task.clone()).await.unwrap();
        task.done.notified().await;

        assert_eq!(task.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(task.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_hook_after_budget() {
        let queue = TaskQueue::start(settings(1));
        let task = flaky(10);

        queue.enqueue(task.clone()).await.unwrap();
        task.done.notified().await;

        assert_eq!(task.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(task.failures.load(Ordering::SeqCst), 1);
    }

    struct Sleeper {
        timed_out: Notify,
    }

    #[async_trait]
    impl BackgroundTask for Sleeper {
        fn name(&self) -> String {
            "sleeper".into()
        }

        async fn run(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn is_retryable(&self, _error: &anyhow::Error) -> bool {
            false
        }

        async fn on_failure(&self, error: anyhow::Error) {
            assert!(error.to_string().contains("timed out"));
            self.timed_out.notify_one();
        }
    }

    #[tokio::test]
    async fn test_attempts_are_bounded_by_timeout() {
        let queue = TaskQueue::start(settings(3));
        let task = Arc::new(Sleeper { timed_out: Notify::new() });

        queue.enqueue(task.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task.timed_out.notified())
            .await
            .unwrap();
    }
}
