use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use queue_common::message::{dead_letter_queue_name, DeadLetterMessage, Message};
use queue_common::queue::{DurableQueue, QueueResult};
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::policy::QueueConfiguration;

/// Backoff applied after an unexpected error reading from the durable queue.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How often the pool re-checks the active job count while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process-wide pool tunables, set once at construction.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_concurrent_jobs_global: usize,
    pub poll_interval_when_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_global: 100,
            poll_interval_when_idle: Duration::from_secs(1),
        }
    }
}

/// A queue configuration together with its in-flight job counter.
struct RegisteredQueue<C> {
    config: Arc<QueueConfiguration<C>>,
    active: Arc<AtomicUsize>,
}

/// Releases one job slot (global and per-queue) when dropped, so the
/// counters are decremented on every exit path, panics included.
struct JobGuard {
    global_active: Arc<AtomicUsize>,
    queue_active: Arc<AtomicUsize>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.global_active.fetch_sub(1, Ordering::SeqCst);
        self.queue_active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A worker pool polling one or more durable queues and dispatching their
/// messages to registered handlers under bounded concurrency.
///
/// Queues are registered before `run` is called; the pool then runs one
/// polling loop per queue until `stop` is called, at which point it stops
/// fetching new batches and waits for in-flight handlers to finish.
pub struct WorkerPool<C> {
    queue: Arc<dyn DurableQueue>,
    context: Arc<C>,
    config: PoolConfig,
    registry: HashMap<String, RegisteredQueue<C>>,
    global_active: Arc<AtomicUsize>,
    running: AtomicBool,
    stopping: Arc<AtomicBool>,
}

impl<C: Send + Sync + 'static> WorkerPool<C> {
    pub fn new(queue: Arc<dyn DurableQueue>, context: Arc<C>, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_concurrent_jobs_global: config.max_concurrent_jobs_global.max(1),
            ..config
        };

        Self {
            queue,
            context,
            config,
            registry: HashMap::new(),
            global_active: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a queue with the pool. Must be called before `run`;
    /// registering the same name twice replaces the earlier configuration.
    pub fn register_queue(&mut self, config: QueueConfiguration<C>) {
        if self.running.load(Ordering::SeqCst) {
            warn!(queue = %config.name, "cannot register a queue while the pool is running");
            return;
        }

        let name = config.name.clone();
        let registered = RegisteredQueue {
            config: Arc::new(config),
            active: Arc::new(AtomicUsize::new(0)),
        };

        if self.registry.insert(name.clone(), registered).is_some() {
            warn!(queue = %name, "queue was already registered, replacing its configuration");
        }
    }

    /// Run one polling loop per registered queue until `stop` is called.
    /// Returns once every loop has exited and in-flight jobs have drained.
    /// Calling `run` while already running is a logged no-op.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("worker pool is already running");
            return;
        }

        info!(
            queues = self.registry.len(),
            max_concurrent_jobs = self.config.max_concurrent_jobs_global,
            "starting worker pool"
        );

        let mut loops = Vec::with_capacity(self.registry.len());
        for registered in self.registry.values() {
            let poll_loop = PollLoop {
                queue: self.queue.clone(),
                context: self.context.clone(),
                config: registered.config.clone(),
                pool: self.config,
                queue_active: registered.active.clone(),
                global_active: self.global_active.clone(),
                stopping: self.stopping.clone(),
            };
            loops.push(tokio::spawn(poll_loop.run()));
        }

        for result in join_all(loops).await {
            if let Err(error) = result {
                error!(%error, "polling loop terminated abnormally");
            }
        }

        self.wait_for_drain().await;
        info!("worker pool stopped");
    }

    /// Signal every polling loop to stop fetching new batches, then block
    /// until in-flight jobs have drained.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        self.stopping.store(true, Ordering::SeqCst);
        self.wait_for_drain().await;
    }

    async fn wait_for_drain(&self) {
        loop {
            let active = self.global_active.load(Ordering::SeqCst);
            if active == 0 {
                break;
            }
            info!(active, "waiting for in-flight jobs to finish");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of jobs currently in flight across all queues.
    pub fn global_active(&self) -> usize {
        self.global_active.load(Ordering::SeqCst)
    }

    /// Number of jobs currently in flight for one queue.
    pub fn queue_active(&self, queue: &str) -> usize {
        self.registry
            .get(queue)
            .map_or(0, |registered| registered.active.load(Ordering::SeqCst))
    }
}

/// The polling loop for a single registered queue.
struct PollLoop<C> {
    queue: Arc<dyn DurableQueue>,
    context: Arc<C>,
    config: Arc<QueueConfiguration<C>>,
    pool: PoolConfig,
    queue_active: Arc<AtomicUsize>,
    global_active: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
}

impl<C> Clone for PollLoop<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            context: self.context.clone(),
            config: self.config.clone(),
            pool: self.pool,
            queue_active: self.queue_active.clone(),
            global_active: self.global_active.clone(),
            stopping: self.stopping.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> PollLoop<C> {
    async fn run(self) {
        debug!(queue = %self.config.name, "polling loop started");

        while !self.stopping.load(Ordering::SeqCst) {
            metrics::gauge!("queue_worker_saturation_percent").set(
                self.global_active.load(Ordering::SeqCst) as f64
                    / self.pool.max_concurrent_jobs_global as f64,
            );

            let admitted = self.reserve_batch();
            if admitted == 0 {
                tokio::time::sleep(self.pool.poll_interval_when_idle).await;
                continue;
            }

            let messages = match self
                .queue
                .read(
                    &self.config.name,
                    self.config.policy.visibility_timeout,
                    admitted,
                )
                .await
            {
                Ok(messages) => messages,
                Err(error) => {
                    self.release(admitted);
                    error!(queue = %self.config.name, %error, "failed to read from queue");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if messages.is_empty() {
                self.release(admitted);
                tokio::time::sleep(self.pool.poll_interval_when_idle).await;
                continue;
            }

            self.release(admitted.saturating_sub(messages.len()));
            debug!(queue = %self.config.name, count = messages.len(), "dispatching batch");

            if self.config.policy.sequential {
                self.dispatch_sequential(messages).await;
            } else {
                self.dispatch_parallel(messages);
            }
        }

        debug!(queue = %self.config.name, "polling loop stopped");
    }

    /// Reserve up to `batch_size` job slots against the per-queue and global
    /// concurrency budgets, returning how many were reserved.
    ///
    /// The global counter is claimed with a compare-exchange so that
    /// concurrent loops cannot oversubscribe the global cap between
    /// computing headroom and reading a batch. The per-queue counter is only
    /// ever incremented by its own loop, so a plain add suffices there.
    fn reserve_batch(&self) -> usize {
        let policy = &self.config.policy;
        let available_for_queue = policy
            .max_concurrent_jobs
            .saturating_sub(self.queue_active.load(Ordering::SeqCst));

        loop {
            let global = self.global_active.load(Ordering::SeqCst);
            let available_globally = self
                .pool
                .max_concurrent_jobs_global
                .saturating_sub(global);

            let admitted = policy
                .batch_size
                .min(available_for_queue)
                .min(available_globally);
            if admitted == 0 {
                return 0;
            }

            if self
                .global_active
                .compare_exchange(global, global + admitted, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.queue_active.fetch_add(admitted, Ordering::SeqCst);
                return admitted;
            }
            // Another loop moved the global counter; recompute.
        }
    }

    /// Return unused reserved slots to both budgets.
    fn release(&self, count: usize) {
        if count > 0 {
            self.global_active.fetch_sub(count, Ordering::SeqCst);
            self.queue_active.fetch_sub(count, Ordering::SeqCst);
        }
    }

    /// Take over one already-reserved slot; the guard releases it on completion.
    fn job_guard(&self) -> JobGuard {
        JobGuard {
            global_active: self.global_active.clone(),
            queue_active: self.queue_active.clone(),
        }
    }

    /// Process each message to completion, including archive/retry
    /// bookkeeping, before the next one begins.
    async fn dispatch_sequential(&self, messages: Vec<Message>) {
        for message in messages {
            let guard = self.job_guard();
            self.process_message(message, guard).await;
        }
    }

    /// Spawn one task per admitted message; completion is tracked only
    /// through the job counters.
    fn dispatch_parallel(&self, messages: Vec<Message>) {
        for message in messages {
            let guard = self.job_guard();
            let task = self.clone();
            tokio::spawn(async move {
                task.process_message(message, guard).await;
            });
        }
    }

    async fn process_message(&self, message: Message, guard: JobGuard) {
        let policy = &self.config.policy;
        let labels = [("queue", self.config.name.clone())];

        metrics::counter!("queue_jobs_total", &labels).increment(1);
        let started = tokio::time::Instant::now();

        // Only sequential handlers get an explicit timeout: a stuck handler
        // would otherwise block its whole queue past the message's
        // invisibility window. Parallel overruns are covered by the queue's
        // own visibility-timeout redelivery.
        let result = if policy.sequential {
            match tokio::time::timeout(
                policy.visibility_timeout,
                self.config.handler.handle(self.context.as_ref(), &message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HandlerError::TimedOut(policy.visibility_timeout)),
            }
        } else {
            self.config.handler.handle(self.context.as_ref(), &message).await
        };

        metrics::histogram!("queue_job_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("queue_jobs_completed", &labels).increment(1);
                if let Err(error) = self.queue.archive(&self.config.name, message.id).await {
                    // The work is done; re-running the handler would
                    // duplicate its side effects.
                    error!(
                        queue = %self.config.name,
                        message_id = message.id,
                        %error,
                        "failed to archive completed message"
                    );
                }
            }
            Err(handler_error) => {
                self.handle_message_failure(&message, &handler_error).await;
            }
        }

        drop(guard);
    }

    async fn handle_message_failure(&self, message: &Message, handler_error: &HandlerError) {
        let name = &self.config.name;
        let policy = &self.config.policy;
        let labels = [("queue", name.clone())];

        if message.read_count < policy.max_retries {
            metrics::counter!("queue_jobs_retried", &labels).increment(1);
            warn!(
                queue = %name,
                message_id = message.id,
                read_count = message.read_count,
                max_retries = policy.max_retries,
                %handler_error,
                "handler failed, scheduling retry"
            );
            if let Err(error) = self
                .reschedule(name, message, handler_error, policy.retry_delay)
                .await
            {
                error!(queue = %name, message_id = message.id, %error, "failed to schedule retry");
            }
            return;
        }

        metrics::counter!("queue_jobs_failed", &labels).increment(1);

        if policy.move_to_dlq_on_exhaustion {
            warn!(
                queue = %name,
                message_id = message.id,
                read_count = message.read_count,
                %handler_error,
                "retries exhausted, moving message to dead letter queue"
            );
            match self
                .reschedule(
                    &dead_letter_queue_name(name),
                    message,
                    handler_error,
                    Duration::ZERO,
                )
                .await
            {
                Ok(()) => {
                    metrics::counter!("queue_jobs_dead_lettered", &labels).increment(1);
                }
                Err(error) => {
                    error!(
                        queue = %name,
                        message_id = message.id,
                        %error,
                        "failed to write dead letter message"
                    );
                }
            }
        } else {
            warn!(
                queue = %name,
                message_id = message.id,
                read_count = message.read_count,
                %handler_error,
                "retries exhausted, dropping message"
            );
        }

        // Archived even if the dead letter write failed: losing the failure
        // record beats reprocessing the message forever.
        if let Err(error) = self.queue.archive(name, message.id).await {
            error!(queue = %name, message_id = message.id, %error, "failed to archive exhausted message");
        }
    }

    /// Make a message deliverable again after `delay`: in place on its own
    /// queue for a retry, or as a new dead letter record when the
    /// destination differs. Retry scheduling and dead-letter routing are the
    /// same primitive with a different destination.
    async fn reschedule(
        &self,
        destination: &str,
        message: &Message,
        handler_error: &HandlerError,
        delay: Duration,
    ) -> QueueResult<()> {
        if destination == self.config.name {
            self.queue
                .set_visibility_timeout(destination, message.id, delay)
                .await
        } else {
            let dead_letter = DeadLetterMessage::new(message.id, &handler_error.to_string());
            self.queue
                .send(destination, dead_letter.into_body(), delay)
                .await?;
            Ok(())
        }
    }
}
