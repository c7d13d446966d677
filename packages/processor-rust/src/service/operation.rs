use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use opbus_core::{CategorizedError, CodecError, Entity, OperationRequest, OperationResult};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Context carried with every delivery attempt through the pipeline.
///
/// The cancellation token fires when the transport lock can no longer be
/// renewed. The deadline, when set, is usually derived from the request's
/// expiration timestamp by `ApiOperation::new_context_for_operation`.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub delivery_id: String,
    pub cancellation: CancellationToken,
    pub deadline: Option<SystemTime>,
    values: Arc<BTreeMap<String, String>>,
}

/// Why a stage was aborted by its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl OperationContext {
    #[must_use]
    pub fn new(delivery_id: impl Into<String>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            cancellation: CancellationToken::new(),
            deadline: None,
            values: Arc::new(BTreeMap::new()),
        }
    }

    /// Derive a context whose deadline is the earlier of the current one and
    /// `deadline`. Cancellation is shared with the parent.
    #[must_use]
    pub fn with_deadline(&self, deadline: SystemTime) -> Self {
        let mut next = self.clone();
        next.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        next
    }

    /// Derive a context carrying an additional scoped value.
    #[must_use]
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time left before the deadline. `None` when no deadline is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first. An already-cancelled context never polls `fut`.
    ///
    /// # Errors
    ///
    /// Returns `ContextError` when the context ends before `fut` completes.
    pub async fn scope<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        let remaining = self.remaining();
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(ContextError::Cancelled),
            () = sleep_for(remaining) => Err(ContextError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

async fn sleep_for(remaining: Option<Duration>) {
    match remaining {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// ApiOperation trait
// ---------------------------------------------------------------------------

/// Lifecycle contract implemented by every operation type.
///
/// A fresh instance is created per delivery attempt. The pipeline calls, in
/// order: `init`, `new_context_for_operation`, `entity_fetcher`,
/// `guard_concurrency`, `run`. `retry` is called only on a failure path, after
/// the pipeline has incremented the request's retry count.
#[async_trait]
pub trait ApiOperation: Send + Sync {
    /// Bind the envelope into internal state. Called exactly once per attempt,
    /// before any other lifecycle method. If init fails or panics, the
    /// pipeline restores the incoming envelope before scheduling the retry.
    async fn init(&mut self, ctx: &OperationContext, request: OperationRequest)
        -> anyhow::Result<()>;

    /// Resolve the target entity using the ids captured at init.
    async fn entity_fetcher(&mut self, ctx: &OperationContext) -> anyhow::Result<Box<dyn Entity>>;

    /// Decide whether this attempt may run against the freshly fetched entity.
    async fn guard_concurrency(
        &mut self,
        ctx: &OperationContext,
        entity: &dyn Entity,
    ) -> Result<(), CategorizedError>;

    /// Execute the business logic. A result carrying an error is retried.
    async fn run(&mut self, ctx: &OperationContext) -> OperationResult;

    /// Re-enqueue the current request for a future attempt.
    async fn retry(&mut self, ctx: &OperationContext) -> anyhow::Result<()>;

    /// Current request state.
    fn operation_request(&self) -> &OperationRequest;

    /// Mutable request state; the pipeline uses it to bump the retry count.
    fn operation_request_mut(&mut self) -> &mut OperationRequest;

    /// Operation type name for diagnostics.
    fn name(&self) -> &str;

    /// Attach scoped values or a deadline before the entity is fetched.
    ///
    /// The default derives the deadline from the request's expiration
    /// timestamp and refuses requests that have already expired.
    fn new_context_for_operation(&self, ctx: &OperationContext) -> anyhow::Result<OperationContext> {
        let request = self.operation_request();
        if request.is_expired(SystemTime::now()) {
            anyhow::bail!("operation {} expired before execution", request.operation_id);
        }
        Ok(match request.expiration_deadline() {
            Some(deadline) => ctx.with_deadline(deadline),
            None => ctx.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Stage / StageError
// ---------------------------------------------------------------------------

/// Pipeline stage in which a delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Match,
    Init,
    NewContext,
    EntityFetch,
    GuardConcurrency,
    Run,
    Retry,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Match => "match",
            Self::Init => "init",
            Self::NewContext => "new_context",
            Self::EntityFetch => "entity_fetcher",
            Self::GuardConcurrency => "guard_concurrency",
            Self::Run => "run",
            Self::Retry => "retry",
        }
    }

    /// Stages that run with a live operation instance.
    #[must_use]
    pub fn has_operation(self) -> bool {
        !matches!(self, Self::Decode | Self::Match)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single delivery attempt, tagged with the stage it came from.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("malformed operation envelope: {0}")]
    Decode(#[from] CodecError),
    #[error("operation has retried {retry_count} times, the limit is {limit}")]
    RetryLimitExceeded { retry_count: u32, limit: u32 },
    #[error("operation type {name:?} is not registered")]
    UnknownOperationType { name: String },
    #[error("{stage} failed: {source}")]
    Failed {
        stage: Stage,
        source: anyhow::Error,
    },
    #[error("concurrency guard blocked the operation: {0}")]
    Guarded(#[source] CategorizedError),
    #[error("{stage} aborted: {reason}")]
    Aborted { stage: Stage, reason: ContextError },
    #[error("{stage} panicked: {message}")]
    Panicked { stage: Stage, message: String },
}

impl StageError {
    #[must_use]
    pub fn failed(stage: Stage, source: anyhow::Error) -> Self {
        Self::Failed { stage, source }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Decode(_) => Stage::Decode,
            Self::RetryLimitExceeded { .. } | Self::UnknownOperationType { .. } => Stage::Match,
            Self::Guarded(_) => Stage::GuardConcurrency,
            Self::Failed { stage, .. }
            | Self::Aborted { stage, .. }
            | Self::Panicked { stage, .. } => *stage,
        }
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    #[must_use]
    pub fn from_panic(stage: Stage, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { stage, message }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_deadline_keeps_earliest() {
        let now = SystemTime::now();
        let early = now + Duration::from_secs(5);
        let late = now + Duration::from_secs(50);
        let ctx = OperationContext::new("d-1").with_deadline(early);
        assert_eq!(ctx.with_deadline(late).deadline, Some(early));
        let ctx = OperationContext::new("d-1").with_deadline(late);
        assert_eq!(ctx.with_deadline(early).deadline, Some(early));
    }

    #[test]
    fn derived_contexts_share_cancellation() {
        let ctx = OperationContext::new("d-1");
        let derived = ctx
            .with_value("tenant", "contoso")
            .with_deadline(SystemTime::now() + Duration::from_secs(60));
        ctx.cancellation.cancel();
        assert!(derived.is_cancelled());
        assert_eq!(derived.value("tenant"), Some("contoso"));
        assert_eq!(ctx.value("tenant"), None);
    }

    #[tokio::test]
    async fn scope_returns_output_when_future_finishes() {
        let ctx = OperationContext::new("d-1");
        assert_eq!(ctx.scope(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn scope_never_polls_when_already_cancelled() {
        let ctx = OperationContext::new("d-1");
        ctx.cancellation.cancel();
        let polled = std::sync::atomic::AtomicBool::new(false);
        let out = ctx
            .scope(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert_eq!(out, Err(ContextError::Cancelled));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn scope_aborts_at_deadline() {
        let ctx = OperationContext::new("d-1")
            .with_deadline(SystemTime::now() + Duration::from_millis(20));
        let out = ctx
            .scope(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn scope_aborts_on_cancellation_mid_flight() {
        let ctx = OperationContext::new("d-1");
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let out = ctx
            .scope(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(ContextError::Cancelled));
    }

    #[test]
    fn stage_errors_report_their_stage() {
        let err = StageError::failed(Stage::Run, anyhow::anyhow!("boom"));
        assert_eq!(err.stage(), Stage::Run);
        assert_eq!(err.to_string(), "run failed: boom");

        let err = StageError::UnknownOperationType {
            name: "Nope".to_string(),
        };
        assert_eq!(err.stage(), Stage::Match);
        assert!(!err.stage().has_operation());

        let err = StageError::Guarded(CategorizedError::conflict("busy"));
        assert_eq!(err.stage(), Stage::GuardConcurrency);
        assert!(err.stage().has_operation());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static text");
        let err = StageError::from_panic(Stage::Run, payload.as_ref());
        assert_eq!(err.to_string(), "run panicked: static text");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned text"));
        let err = StageError::from_panic(Stage::EntityFetch, payload.as_ref());
        assert_eq!(err.to_string(), "entity_fetcher panicked: owned text");
    }
}
