//! Generic stage execution: idempotency guard, per-attempt timeout, wall
//! clock, transient-only retries with jittered exponential backoff, event
//! emission and outcome persistence.
//!
//! The runner never raises stage failures to the caller; it records them
//! and lets the orchestrator decide what the downstream stages may do.
//! Only infrastructure failures (the progress store going away) surface
//! as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use super::CancelToken;
use crate::config::PipelineConfig;
use crate::domain::{Payload, Stage, StageOutcome, StageStatus, Value};
use crate::error::{FlowError, Result, StageError};
use crate::event::{EventBus, StageEvent};
use crate::pipeline::ProgressStore;

/// Capped exponential backoff with symmetric jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            factor: config.backoff_factor,
            jitter: config.backoff_jitter,
            ceiling: Duration::from_millis(config.backoff_ceiling_ms),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = base.min(self.ceiling.as_millis() as f64);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// Retry and timeout budget for one stage kind.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    pub retry_budget: u32,
    pub attempt_timeout: Duration,
    pub wall_clock: Duration,
    pub backoff: BackoffPolicy,
}

impl StagePolicy {
    pub fn llm(config: &PipelineConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            attempt_timeout: Duration::from_secs(config.llm_attempt_timeout_secs),
            wall_clock: Duration::from_secs(config.llm_wall_clock_secs),
            backoff: BackoffPolicy::from_config(config),
        }
    }

    pub fn geocode(config: &PipelineConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            attempt_timeout: Duration::from_secs(config.geocode_attempt_timeout_secs),
            wall_clock: Duration::from_secs(config.geocode_wall_clock_secs),
            backoff: BackoffPolicy::from_config(config),
        }
    }

    pub fn spam(config: &PipelineConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            attempt_timeout: Duration::from_secs(config.spam_attempt_timeout_secs),
            wall_clock: Duration::from_secs(config.spam_wall_clock_secs),
            backoff: BackoffPolicy::from_config(config),
        }
    }

    /// For in-process stages (PII scrub, priority): no retries, generous
    /// timeout.
    pub fn local(config: &PipelineConfig) -> Self {
        Self {
            retry_budget: 0,
            attempt_timeout: Duration::from_secs(30),
            wall_clock: Duration::from_secs(30),
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// What a stage function hands back on success: the value plus what the
/// completed event should carry.
#[derive(Debug, Clone)]
pub struct StageOutput<T> {
    pub value: T,
    pub data: Payload,
    pub message: String,
}

impl<T> StageOutput<T> {
    pub fn new(value: T, message: impl Into<String>) -> Self {
        Self {
            value,
            data: Payload::new(),
            message: message.into(),
        }
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug)]
pub enum StageResult<T> {
    Completed(T),
    /// The idempotency guard found a completed outcome; `f` was not run.
    AlreadyCompleted,
    Failed(StageError),
}

impl<T> StageResult<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Clone)]
pub struct StageRunner {
    store: ProgressStore,
    bus: Arc<EventBus>,
    store_write_timeout: Duration,
}

impl StageRunner {
    pub fn new(store: ProgressStore, bus: Arc<EventBus>, config: &PipelineConfig) -> Self {
        Self {
            store,
            bus,
            store_write_timeout: Duration::from_secs(config.store_write_timeout_secs),
        }
    }

    /// Execute `f` for one (ticket, stage) under the given policy.
    ///
    /// `f` receives the zero-based attempt number and must be safe to
    /// re-invoke: all of its side effects go through content-addressed or
    /// idempotent writes.
    pub async fn run<T, F, Fut>(
        &self,
        ticket_id: Uuid,
        batch_id: Uuid,
        stage: Stage,
        policy: &StagePolicy,
        cancel: &CancelToken,
        mut f: F,
    ) -> Result<StageResult<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<StageOutput<T>, StageError>>,
    {
        // Idempotency guard: a completed stage is never re-run.
        if let Some(existing) = self.store.get(ticket_id, stage).await? {
            if existing.status == StageStatus::Completed {
                debug!(ticket_id = %ticket_id, stage = %stage, "stage already completed");
                return Ok(StageResult::AlreadyCompleted);
            }
        }

        let outcome = StageOutcome::started(ticket_id, batch_id, stage);
        self.persist(outcome.clone()).await?;
        self.bus.publish(
            StageEvent::ticket(ticket_id, batch_id, stage).with_status(StageStatus::InProgress),
        );

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return self.finish_failed(outcome, started, StageError::Cancelled).await;
            }

            let elapsed = started.elapsed();
            if elapsed >= policy.wall_clock {
                let err = StageError::Transient(format!(
                    "wall clock exceeded after {} ms",
                    elapsed.as_millis()
                ));
                return self.finish_failed(outcome, started, err).await;
            }
            let attempt_budget = policy.attempt_timeout.min(policy.wall_clock - elapsed);

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(StageError::Cancelled),
                attempt_result = timeout(attempt_budget, f(attempt)) => match attempt_result {
                    Ok(inner) => inner,
                    Err(_) => Err(StageError::Transient(format!(
                        "attempt timed out after {} ms",
                        attempt_budget.as_millis()
                    ))),
                },
            };

            match result {
                Ok(output) => {
                    let completed = outcome.completed(&output.message);
                    self.persist(completed.clone()).await?;
                    let mut data = output.data;
                    data.insert(
                        "elapsed_ms".to_string(),
                        Value::from(started.elapsed().as_millis() as u64),
                    );
                    self.bus.publish(
                        StageEvent::ticket(ticket_id, batch_id, stage)
                            .with_status(StageStatus::Completed)
                            .with_data(data)
                            .with_message(output.message),
                    );
                    return Ok(StageResult::Completed(output.value));
                }
                Err(err) if err.is_transient() && attempt < policy.retry_budget => {
                    let delay = policy.backoff.delay(attempt);
                    warn!(
                        ticket_id = %ticket_id,
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient stage failure, backing off"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self
                                .finish_failed(outcome, started, StageError::Cancelled)
                                .await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    return self.finish_failed(outcome, started, err).await;
                }
            }
        }
    }

    async fn finish_failed<T>(
        &self,
        outcome: StageOutcome,
        started: Instant,
        err: StageError,
    ) -> Result<StageResult<T>> {
        let ticket_id = outcome.ticket_id;
        let batch_id = outcome.batch_id;
        let stage = outcome.stage;
        warn!(ticket_id = %ticket_id, stage = %stage, error = %err, "stage failed");

        self.persist(outcome.failed(err.to_string())).await?;
        let mut data = Payload::new();
        data.insert(
            "elapsed_ms".to_string(),
            Value::from(started.elapsed().as_millis() as u64),
        );
        self.bus.publish(
            StageEvent::ticket(ticket_id, batch_id, stage)
                .with_status(StageStatus::Failed)
                .with_data(data)
                .with_message(err.to_string()),
        );
        Ok(StageResult::Failed(err))
    }

    /// Persist an outcome within the store-write budget. A store that
    /// cannot be reached is fatal for the batch.
    pub async fn persist(&self, outcome: StageOutcome) -> Result<()> {
        match timeout(self.store_write_timeout, self.store.record(outcome)).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::Store(format!(
                "progress write exceeded {} ms",
                self.store_write_timeout.as_millis()
            ))),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::pipeline::cancel_pair;

    fn fast_policy() -> StagePolicy {
        StagePolicy {
            retry_budget: 2,
            attempt_timeout: Duration::from_millis(200),
            wall_clock: Duration::from_secs(2),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(5),
                factor: 2.0,
                jitter: 0.0,
                ceiling: Duration::from_millis(20),
            },
        }
    }

    fn runner() -> (StageRunner, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let store = ProgressStore::in_memory().unwrap();
        (
            StageRunner::new(store, Arc::clone(&bus), &PipelineConfig::default()),
            bus,
        )
    }

    #[tokio::test]
    async fn test_success_emits_started_and_completed() {
        let (runner, bus) = runner();
        let sub = bus.subscribe().unwrap();
        let (_handle, token) = cancel_pair();
        let (ticket, batch) = (Uuid::new_v4(), Uuid::new_v4());

        let result = runner
            .run(ticket, batch, Stage::SpamFilter, &fast_policy(), &token, |_| async {
                Ok(StageOutput::new(42u32, "done"))
            })
            .await
            .unwrap();

        assert_eq!(result.value(), Some(42));
        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, StageStatus::InProgress);
        assert_eq!(events[1].status, StageStatus::Completed);
        assert!(events[0].timestamp <= events[1].timestamp);

        let stored = runner.store().get(ticket, Stage::SpamFilter).await.unwrap();
        assert_eq!(stored.unwrap().status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let (runner, _bus) = runner();
        let (_handle, token) = cancel_pair();
        let attempts = AtomicU32::new(0);

        let result = runner
            .run(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Stage::LlmAnalysis,
                &fast_policy(),
                &token,
                |_| {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(StageError::Transient("flaky".into()))
                        } else {
                            Ok(StageOutput::new("analysis", "ok"))
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result.value(), Some("analysis"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (runner, _bus) = runner();
        let (_handle, token) = cancel_pair();
        let attempts = AtomicU32::new(0);
        let (ticket, batch) = (Uuid::new_v4(), Uuid::new_v4());

        let result: StageResult<()> = runner
            .run(ticket, batch, Stage::LlmAnalysis, &fast_policy(), &token, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::Permanent("bad request".into())) }
            })
            .await
            .unwrap();

        assert!(result.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let stored = runner.store().get(ticket, Stage::LlmAnalysis).await.unwrap();
        assert_eq!(stored.unwrap().status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_records_failed() {
        let (runner, _bus) = runner();
        let (_handle, token) = cancel_pair();
        let attempts = AtomicU32::new(0);

        let result: StageResult<()> = runner
            .run(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Stage::Geocode,
                &fast_policy(),
                &token,
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(StageError::Transient("still down".into())) }
                },
            )
            .await
            .unwrap();

        assert!(result.is_failed());
        // initial attempt + retry budget
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_idempotency_guard_skips_completed_stage() {
        let (runner, _bus) = runner();
        let (_handle, token) = cancel_pair();
        let (ticket, batch) = (Uuid::new_v4(), Uuid::new_v4());

        runner
            .run(ticket, batch, Stage::PiiScrub, &fast_policy(), &token, |_| async {
                Ok(StageOutput::new(1u32, "first"))
            })
            .await
            .unwrap();

        let attempts = AtomicU32::new(0);
        let second = runner
            .run(ticket, batch, Stage::PiiScrub, &fast_policy(), &token, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(StageOutput::new(2u32, "second")) }
            })
            .await
            .unwrap();

        assert!(matches!(second, StageResult::AlreadyCompleted));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_records_cancelled_failure() {
        let (runner, _bus) = runner();
        let (handle, token) = cancel_pair();
        let (ticket, batch) = (Uuid::new_v4(), Uuid::new_v4());
        handle.cancel();

        let result: StageResult<()> = runner
            .run(ticket, batch, Stage::LlmAnalysis, &fast_policy(), &token, |_| async {
                Ok(StageOutput::new((), "unreachable"))
            })
            .await
            .unwrap();

        match result {
            StageResult::Failed(err) => assert!(err.is_cancelled()),
            other => panic!("expected cancelled failure, got {other:?}"),
        }
        let stored = runner.store().get(ticket, Stage::LlmAnalysis).await.unwrap();
        let stored = stored.unwrap();
        assert_eq!(stored.status, StageStatus::Failed);
        assert!(stored.error_detail.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let (runner, _bus) = runner();
        let (_handle, token) = cancel_pair();
        let attempts = AtomicU32::new(0);
        let policy = StagePolicy {
            retry_budget: 1,
            attempt_timeout: Duration::from_millis(20),
            wall_clock: Duration::from_secs(2),
            backoff: fast_policy().backoff,
        };

        let result = runner
            .run(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Stage::Geocode,
                &policy,
                &token,
                |_| {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        Ok(StageOutput::new("resolved", "ok"))
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result.value(), Some("resolved"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(250),
            factor: 2.0,
            jitter: 0.0,
            ceiling: Duration::from_millis(4000),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(10), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(1000),
            factor: 1.0,
            jitter: 0.2,
            ceiling: Duration::from_millis(4000),
        };
        for _ in 0..50 {
            let d = backoff.delay(0).as_millis() as f64;
            assert!((800.0..=1200.0).contains(&d), "delay {d} out of band");
        }
    }
}
