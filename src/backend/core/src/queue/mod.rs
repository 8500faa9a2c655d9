//! Bounded, retrying task executor with coalescing by task id.
//!
//! The queue runs at most `concurrency` tasks at once. Tasks are identified
//! by a caller-chosen id; a submit whose id matches a running task attaches
//! to it instead of running the work twice, and a submit whose id matches a
//! queued task replaces the pending work while keeping everyone waiting on
//! it. Failed attempts retry with exponential backoff when the error says
//! retrying can help.

pub mod task;

pub use task::{QueueConfig, SubmitOptions, TaskError, TaskEvent, TaskPriority};

use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

type TaskOperation<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, TaskError>> + Send + Sync + 'static>;
type Waiter<T> = oneshot::Sender<Result<T, TaskError>>;

struct QueuedEntry<T> {
    id: String,
    operation: TaskOperation<T>,
    priority: TaskPriority,
    max_attempts: u32,
    seq: u64,
    waiters: Vec<Waiter<T>>,
}

struct RunningEntry<T> {
    waiters: Vec<Waiter<T>>,
}

struct QueueState<T> {
    queued: Vec<QueuedEntry<T>>,
    running: HashMap<String, RunningEntry<T>>,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub running_tasks: usize,
    pub concurrency: usize,
}

/// Bounded task executor. Shared as `Arc<TaskQueue<T>>`; every fetch path
/// in the facade funnels through one instance so the concurrency bound
/// holds process-wide.
pub struct TaskQueue<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    seq: AtomicU64,
    events: broadcast::Sender<TaskEvent>,
    // Handle to the owning Arc, for spawning runner tasks from &self.
    this: Weak<Self>,
}

impl<T: Clone + Send + 'static> TaskQueue<T> {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|this| Self {
            config,
            state: Mutex::new(QueueState {
                queued: Vec::new(),
                running: HashMap::new(),
            }),
            seq: AtomicU64::new(0),
            events,
            this: this.clone(),
        })
    }

    /// Subscribe to task lifecycle events. Slow subscribers lose old events
    /// rather than blocking the queue.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Submit a task and wait for its result.
    ///
    /// If a task with the same id is already running, this call attaches to
    /// the in-flight run and shares its outcome. If one is queued but not
    /// yet started, the queued operation is replaced by this one and both
    /// callers receive the replacement's outcome.
    pub async fn submit<F, Fut>(
        &self,
        id: impl Into<String>,
        operation: F,
        options: SubmitOptions,
    ) -> Result<T, TaskError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let id = id.into();
        let operation: TaskOperation<T> = Arc::new(move || Box::pin(operation()));
        let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();

            if let Some(running) = state.running.get_mut(&id) {
                debug!(task_id = %id, "Attaching to in-flight task");
                running.waiters.push(tx);
            } else if let Some(existing) = state.queued.iter_mut().find(|e| e.id == id) {
                // Last submission wins; the entry re-enters the back of its
                // priority band but keeps everyone already waiting on it.
                debug!(task_id = %id, "Replacing queued task");
                existing.operation = operation;
                existing.priority = options.priority;
                existing.max_attempts = max_attempts;
                existing.seq = self.seq.fetch_add(1, Ordering::Relaxed);
                existing.waiters.push(tx);
            } else {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                state.queued.push(QueuedEntry {
                    id: id.clone(),
                    operation,
                    priority: options.priority,
                    max_attempts,
                    seq,
                    waiters: vec![tx],
                });
                gauge!("task_queue_depth").set(state.queued.len() as f64);
            }
        }

        self.pump();

        rx.await
            .unwrap_or_else(|_| Err(TaskError::Cancelled("executor dropped".to_string())))
    }

    /// Start queued tasks while capacity allows.
    fn pump(&self) {
        loop {
            let (id, operation, max_attempts) = {
                let mut state = self.state.lock();
                if state.running.len() >= self.config.concurrency || state.queued.is_empty() {
                    return;
                }

                // Highest priority first, then submission order.
                let best = state
                    .queued
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, e)| (e.priority.rank(), std::cmp::Reverse(e.seq)))
                    .map(|(i, _)| i);
                let Some(index) = best else { return };

                let entry = state.queued.swap_remove(index);
                state.running.insert(
                    entry.id.clone(),
                    RunningEntry {
                        waiters: entry.waiters,
                    },
                );
                gauge!("task_queue_depth").set(state.queued.len() as f64);
                gauge!("task_queue_running").set(state.running.len() as f64);
                (entry.id, entry.operation, entry.max_attempts)
            };

            let Some(queue) = self.this.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                queue.run_task(id, operation, max_attempts).await;
            });
        }
    }

    async fn run_task(self: Arc<Self>, id: String, operation: TaskOperation<T>, max_attempts: u32) {
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            self.emit(TaskEvent::Started {
                task_id: id.clone(),
                attempt,
            });

            match operation().await {
                Ok(value) => break Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.delay_for_attempt(attempt);
                    counter!("task_retries_total").increment(1);
                    warn!(
                        task_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Task attempt failed, retrying"
                    );
                    self.emit(TaskEvent::Retrying {
                        task_id: id.clone(),
                        attempt,
                        delay,
                        error,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(error) => break Err(error),
            }
        };

        self.settle(&id, attempt, outcome);
    }

    /// Deliver the outcome to every waiter and free the slot.
    fn settle(&self, id: &str, attempts: u32, outcome: Result<T, TaskError>) {
        let waiters = {
            let mut state = self.state.lock();
            let waiters = state
                .running
                .remove(id)
                .map(|e| e.waiters)
                .unwrap_or_default();
            gauge!("task_queue_running").set(state.running.len() as f64);
            waiters
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        match &outcome {
            Ok(_) => {
                counter!("task_completed_total").increment(1);
                self.emit(TaskEvent::Completed {
                    task_id: id.to_string(),
                    attempts,
                });
            }
            Err(error) => {
                counter!("task_failed_total").increment(1);
                warn!(task_id = %id, attempts, error = %error, "Task failed permanently");
                self.emit(TaskEvent::Failed {
                    task_id: id.to_string(),
                    attempts,
                    error: error.clone(),
                });
            }
        }

        self.pump();
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queue_length: state.queued.len(),
            running_tasks: state.running.len(),
            concurrency: self.config.concurrency,
        }
    }

    pub fn running_task_ids(&self) -> Vec<String> {
        self.state.lock().running.keys().cloned().collect()
    }

    pub fn queued_task_ids(&self) -> Vec<String> {
        self.state.lock().queued.iter().map(|e| e.id.clone()).collect()
    }

    /// Drop every queued task. Their waiters receive
    /// [`TaskError::Cancelled`]; running tasks are unaffected. Returns the
    /// number of tasks dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueuedEntry<T>> = {
            let mut state = self.state.lock();
            let drained = state.queued.drain(..).collect();
            gauge!("task_queue_depth").set(0.0);
            drained
        };

        let cleared = drained.len();
        for entry in drained {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(TaskError::Cancelled("queue cleared".to_string())));
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    fn config(concurrency: usize) -> QueueConfig {
        QueueConfig {
            concurrency,
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(40),
        }
    }

    /// Occupy one executor slot until released.
    async fn hold_slot(queue: &Arc<TaskQueue<u32>>) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        let release_op = release.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .submit(
                    "blocker",
                    move || {
                        let release = release_op.clone();
                        async move {
                            release.notified().await;
                            Ok(0)
                        }
                    },
                    SubmitOptions::default(),
                )
                .await
        });
        // let the blocker claim its slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        release
    }

    #[tokio::test]
    async fn test_concurrent_same_id_runs_once() {
        let queue = TaskQueue::new(config(4));
        let invocations = Arc::new(AtomicUsize::new(0));

        let make = |inv: Arc<AtomicUsize>| {
            move || {
                let inv = inv.clone();
                async move {
                    inv.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(7u32)
                }
            }
        };

        let (a, b) = tokio::join!(
            queue.submit("same", make(invocations.clone()), SubmitOptions::default()),
            queue.submit("same", make(invocations.clone()), SubmitOptions::default()),
        );

        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_resubmit_replaces_operation() {
        let queue = TaskQueue::new(config(1));
        let release = hold_slot(&queue).await;

        let first_ran = Arc::new(AtomicUsize::new(0));
        let first_ran_op = first_ran.clone();
        let queue_a = queue.clone();
        let first = tokio::spawn(async move {
            queue_a
                .submit(
                    "job",
                    move || {
                        let first_ran = first_ran_op.clone();
                        async move {
                            first_ran.fetch_add(1, Ordering::SeqCst);
                            Ok(1u32)
                        }
                    },
                    SubmitOptions::default(),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queue_b = queue.clone();
        let second = tokio::spawn(async move {
            queue_b
                .submit("job", || async { Ok(2u32) }, SubmitOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        release.notify_one();

        assert_eq!(first.await.unwrap(), Ok(2));
        assert_eq!(second.await.unwrap(), Ok(2));
        assert_eq!(first_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_priority_order_within_one_slot() {
        let queue = TaskQueue::new(config(1));
        let release = hold_slot(&queue).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let submit = |id: &'static str, priority: TaskPriority| {
            let queue = queue.clone();
            let order = order.clone();
            tokio::spawn(async move {
                queue
                    .submit(
                        id,
                        move || {
                            let order = order.clone();
                            async move {
                                order.lock().push(id);
                                Ok(0u32)
                            }
                        },
                        SubmitOptions::with_priority(priority),
                    )
                    .await
            })
        };

        let a = submit("a", TaskPriority::Low);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = submit("b", TaskPriority::Critical);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let c = submit("c", TaskPriority::High);
        tokio::time::sleep(Duration::from_millis(10)).await;

        release.notify_one();
        let _ = tokio::join!(a, b, c);

        assert_eq!(*order.lock(), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_fifo_within_same_priority() {
        let queue = TaskQueue::new(config(1));
        let release = hold_slot(&queue).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in ["x", "y", "z"] {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(
                        id,
                        move || {
                            let order = order.clone();
                            async move {
                                order.lock().push(id);
                                Ok(0u32)
                            }
                        },
                        SubmitOptions::default(),
                    )
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        release.notify_one();
        for h in handles {
            let _ = h.await;
        }

        assert_eq!(*order.lock(), vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_retries_until_success_with_growing_backoff() {
        let queue = TaskQueue::new(config(2));
        let mut events = queue.subscribe();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_op = attempts.clone();
        let result = queue
            .submit(
                "flaky",
                move || {
                    let attempts = attempts_op.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(TaskError::Transient("connection reset".to_string()))
                        } else {
                            Ok(9u32)
                        }
                    }
                },
                SubmitOptions::default(),
            )
            .await;

        assert_eq!(result, Ok(9));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::Retrying { delay, .. } = event {
                delays.push(delay);
            }
        }
        assert_eq!(delays.len(), 2);
        assert!(delays[1] >= delays[0]);
    }

    #[tokio::test]
    async fn test_transient_exhausts_attempt_budget() {
        let queue = TaskQueue::new(config(2));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_op = attempts.clone();

        let result: Result<u32, _> = queue
            .submit(
                "doomed",
                move || {
                    let attempts = attempts_op.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TaskError::Transient("still down".to_string()))
                    }
                },
                SubmitOptions {
                    max_attempts: Some(2),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(result, Err(TaskError::Transient("still down".to_string())));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_without_retry() {
        let queue = TaskQueue::new(config(2));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_op = attempts.clone();
        let started = Instant::now();

        let result: Result<u32, _> = queue
            .submit(
                "forbidden",
                move || {
                    let attempts = attempts_op.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TaskError::Fatal("missing permissions".to_string()))
                    }
                },
                SubmitOptions::default(),
            )
            .await;

        assert_eq!(
            result,
            Err(TaskError::Fatal("missing permissions".to_string()))
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        // no backoff sleeps happened
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_clear_cancels_queued_waiters() {
        let queue = TaskQueue::new(config(1));
        let release = hold_slot(&queue).await;

        let queue_a = queue.clone();
        let pending = tokio::spawn(async move {
            queue_a
                .submit("pending", || async { Ok(1u32) }, SubmitOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.clear(), 1);
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TaskError::Cancelled(_))));

        // the running blocker is unaffected
        assert_eq!(queue.stats().running_tasks, 1);
        release.notify_one();
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds() {
        let queue = TaskQueue::new(config(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let queue = queue.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(
                        format!("task-{i}"),
                        move || {
                            let peak = peak.clone();
                            let current = current.clone();
                            async move {
                                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(30)).await;
                                current.fetch_sub(1, Ordering::SeqCst);
                                Ok(0u32)
                            }
                        },
                        SubmitOptions::default(),
                    )
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(0));
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_stats_reflect_state() {
        let queue = TaskQueue::new(config(1));
        let release = hold_slot(&queue).await;

        let queue_a = queue.clone();
        let waiting = tokio::spawn(async move {
            queue_a
                .submit("queued", || async { Ok(1u32) }, SubmitOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = queue.stats();
        assert_eq!(stats.running_tasks, 1);
        assert_eq!(stats.queue_length, 1);
        assert_eq!(stats.concurrency, 1);
        assert_eq!(queue.running_task_ids(), vec!["blocker".to_string()]);
        assert_eq!(queue.queued_task_ids(), vec!["queued".to_string()]);

        release.notify_one();
        let _ = waiting.await;

        let stats = queue.stats();
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.queue_length, 0);
    }
}
