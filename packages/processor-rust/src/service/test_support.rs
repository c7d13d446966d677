//! Scripted operation used by the pipeline tests.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opbus_core::{CategorizedError, Entity, OperationRequest, OperationResult, WireCodec};
use parking_lot::Mutex;

use super::guard::latest_operation_guard;
use super::operation::{ApiOperation, OperationContext};
use crate::transport::{requeue, InMemoryQueue};

/// Lifecycle call observed by a `ScriptedOperation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init { retry_count: u32 },
    Fetch { entity: u64 },
    Guard { entity: u64 },
    Run,
    Retry { retry_count: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GuardBehavior {
    #[default]
    Allow,
    /// Use the stock latest-operation guard against the scripted entity.
    LatestOperation,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunBehavior {
    #[default]
    Succeed,
    Fail,
    Panic,
    Sleep(Duration),
}

/// Behaviour shared by every instance created from one registration, plus
/// the event log they all append to.
#[derive(Debug, Default)]
pub struct Script {
    pub fail_init: bool,
    /// Panic in `init` before the request is stored.
    pub panic_init: bool,
    pub fail_fetch: bool,
    pub panic_fetch: bool,
    pub guard: GuardBehavior,
    pub run: RunBehavior,
    pub fail_retry: bool,
    pub entity_latest_operation: Option<String>,
    pub requeue_to: Option<Arc<InMemoryQueue>>,
    pub events: Mutex<Vec<Event>>,
    pub entity_serial: AtomicU64,
}

impl Script {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matches(e)).count()
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[derive(Debug)]
pub struct ScriptedEntity {
    pub serial: u64,
    pub latest_operation_id: Option<String>,
}

impl Entity for ScriptedEntity {
    fn latest_operation_id(&self) -> Option<&str> {
        self.latest_operation_id.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ScriptedOperation {
    script: Arc<Script>,
    request: OperationRequest,
}

impl ScriptedOperation {
    pub fn new(script: Arc<Script>) -> Self {
        Self {
            script,
            request: OperationRequest::default(),
        }
    }
}

#[async_trait]
impl ApiOperation for ScriptedOperation {
    async fn init(
        &mut self,
        _ctx: &OperationContext,
        request: OperationRequest,
    ) -> anyhow::Result<()> {
        self.script.record(Event::Init {
            retry_count: request.retry_count,
        });
        if self.script.panic_init {
            panic!("scripted init panic");
        }
        self.request = request;
        if self.script.fail_init {
            anyhow::bail!("scripted init failure");
        }
        Ok(())
    }

    async fn entity_fetcher(&mut self, _ctx: &OperationContext) -> anyhow::Result<Box<dyn Entity>> {
        let serial = self.script.entity_serial.fetch_add(1, Ordering::SeqCst);
        self.script.record(Event::Fetch { entity: serial });
        if self.script.panic_fetch {
            panic!("scripted fetch panic");
        }
        if self.script.fail_fetch {
            anyhow::bail!("scripted fetch failure");
        }
        Ok(Box::new(ScriptedEntity {
            serial,
            latest_operation_id: self.script.entity_latest_operation.clone(),
        }))
    }

    async fn guard_concurrency(
        &mut self,
        _ctx: &OperationContext,
        entity: &dyn Entity,
    ) -> Result<(), CategorizedError> {
        let serial = entity
            .as_any()
            .downcast_ref::<ScriptedEntity>()
            .map_or(u64::MAX, |e| e.serial);
        self.script.record(Event::Guard { entity: serial });
        match self.script.guard {
            GuardBehavior::Allow => Ok(()),
            GuardBehavior::LatestOperation => latest_operation_guard(entity, &self.request),
            GuardBehavior::Fail => Err(CategorizedError::guard_failure(
                "scripted guard failure",
                anyhow::anyhow!("status store unavailable"),
            )),
        }
    }

    async fn run(&mut self, _ctx: &OperationContext) -> OperationResult {
        self.script.record(Event::Run);
        match self.script.run {
            RunBehavior::Succeed => OperationResult::ok("done"),
            RunBehavior::Fail => OperationResult::failed(500, anyhow::anyhow!("scripted run failure")),
            RunBehavior::Panic => panic!("scripted run panic"),
            RunBehavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                OperationResult::ok("slept")
            }
        }
    }

    async fn retry(&mut self, _ctx: &OperationContext) -> anyhow::Result<()> {
        self.script.record(Event::Retry {
            retry_count: self.request.retry_count,
        });
        if self.script.fail_retry {
            anyhow::bail!("scripted requeue failure");
        }
        if let Some(queue) = &self.script.requeue_to {
            requeue(queue.as_ref(), WireCodec::Json, &self.request).await?;
        }
        Ok(())
    }

    fn operation_request(&self) -> &OperationRequest {
        &self.request
    }

    fn operation_request_mut(&mut self) -> &mut OperationRequest {
        &mut self.request
    }

    fn name(&self) -> &str {
        "Scripted"
    }
}

/// Encode a request with the default codec into a message body.
pub fn encode(request: &OperationRequest) -> bytes::Bytes {
    bytes::Bytes::from(WireCodec::Json.encode(request).expect("encode request"))
}
