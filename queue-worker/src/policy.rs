use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use queue_common::message::Message;

use crate::error::HandlerResult;

/// Advisory priority of a queue. Recorded on the policy and visible to
/// operators; the pool does not preempt lower-priority queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// A handler invoked once per dequeued message.
///
/// The context is an opaque dependency bag (data store clients, API clients,
/// and so on) supplied once at pool construction and shared by every
/// invocation. Handlers must tolerate re-delivery: the pool provides
/// at-least-once semantics, not exactly-once.
#[async_trait]
pub trait MessageHandler<C>: Send + Sync {
    async fn handle(&self, context: &C, message: &Message) -> HandlerResult;
}

/// Per-queue tunables governing batching, retries, and concurrency.
///
/// Built through [`ProcessingPolicy::build`], which enforces the invariants
/// at construction time. In particular a sequential queue never admits more
/// than one concurrent job, since its handlers depend on in-order,
/// non-overlapping execution.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingPolicy {
    pub(crate) priority: Priority,
    pub(crate) batch_size: usize,
    pub(crate) visibility_timeout: Duration,
    pub(crate) max_retries: i32,
    pub(crate) retry_delay: Duration,
    pub(crate) move_to_dlq_on_exhaustion: bool,
    pub(crate) sequential: bool,
    pub(crate) max_concurrent_jobs: usize,
}

impl ProcessingPolicy {
    pub fn build() -> ProcessingPolicyBuilder {
        ProcessingPolicyBuilder::default()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sequential(&self) -> bool {
        self.sequential
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }
}

impl Default for ProcessingPolicy {
    fn default() -> Self {
        Self::build().provide()
    }
}

/// Builder for `ProcessingPolicy`.
pub struct ProcessingPolicyBuilder {
    priority: Priority,
    batch_size: usize,
    visibility_timeout: Duration,
    max_retries: i32,
    retry_delay: Duration,
    move_to_dlq_on_exhaustion: bool,
    sequential: bool,
    max_concurrent_jobs: usize,
}

impl Default for ProcessingPolicyBuilder {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            move_to_dlq_on_exhaustion: true,
            sequential: false,
            max_concurrent_jobs: 10,
        }
    }
}

impl ProcessingPolicyBuilder {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn move_to_dlq_on_exhaustion(mut self, move_to_dlq: bool) -> Self {
        self.move_to_dlq_on_exhaustion = move_to_dlq;
        self
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub fn provide(self) -> ProcessingPolicy {
        // Sequential queues never run two handlers at once.
        let max_concurrent_jobs = if self.sequential {
            1
        } else {
            self.max_concurrent_jobs.max(1)
        };

        ProcessingPolicy {
            priority: self.priority,
            batch_size: self.batch_size.max(1),
            visibility_timeout: self.visibility_timeout,
            max_retries: self.max_retries.max(1),
            retry_delay: self.retry_delay,
            move_to_dlq_on_exhaustion: self.move_to_dlq_on_exhaustion,
            sequential: self.sequential,
            max_concurrent_jobs,
        }
    }
}

/// Static binding of a queue name, a processing policy, and a handler.
/// Immutable once registered with the pool.
pub struct QueueConfiguration<C> {
    pub(crate) name: String,
    pub(crate) policy: ProcessingPolicy,
    pub(crate) handler: Arc<dyn MessageHandler<C>>,
}

impl<C> QueueConfiguration<C> {
    pub fn new(name: &str, policy: ProcessingPolicy, handler: Arc<dyn MessageHandler<C>>) -> Self {
        Self {
            name: name.to_owned(),
            policy,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &ProcessingPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_forces_single_concurrency() {
        let policy = ProcessingPolicy::build()
            .sequential(true)
            .max_concurrent_jobs(8)
            .provide();

        assert!(policy.sequential());
        assert_eq!(policy.max_concurrent_jobs(), 1);
    }

    #[test]
    fn test_builder_clamps_degenerate_values() {
        let policy = ProcessingPolicy::build()
            .batch_size(0)
            .max_retries(0)
            .max_concurrent_jobs(0)
            .provide();

        assert_eq!(policy.batch_size(), 1);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.max_concurrent_jobs(), 1);
    }

    #[test]
    fn test_parallel_policy_keeps_declared_concurrency() {
        let policy = ProcessingPolicy::build().max_concurrent_jobs(4).provide();

        assert!(!policy.sequential());
        assert_eq!(policy.max_concurrent_jobs(), 4);
    }
}
