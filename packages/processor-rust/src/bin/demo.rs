//! `opbus-demo`: runs a processor over an in-memory queue.
//!
//! Enqueues a batch of `Deploy` operations against an in-process deployment
//! store. Every other deployment fails its first attempts so the retry path is
//! visible in the logs, and one message names an unregistered operation type.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use dashmap::DashMap;
use opbus_core::{CategorizedError, Entity, OperationRequest, OperationResult, WireCodec};
use opbus_processor::logging::{init_tracing, LogFormat};
use opbus_processor::service::latest_operation_guard;
use opbus_processor::transport::requeue;
use opbus_processor::{
    ApiOperation, InMemoryController, InMemoryQueue, OperationContext, OperationRegistry,
    Processor, ProcessorConfig,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    Json,
    Msgpack,
}

impl From<CodecArg> for WireCodec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Json => Self::Json,
            CodecArg::Msgpack => Self::MsgPack,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "opbus-demo", about = "Run the operations bus against an in-memory queue")]
struct Args {
    /// Number of Deploy operations to enqueue.
    #[arg(long, env = "OPBUS_OPERATIONS", default_value_t = 6)]
    operations: u32,

    /// Attempts that fail before every other deployment succeeds.
    #[arg(long, env = "OPBUS_FLAKY_ATTEMPTS", default_value_t = 2)]
    flaky_attempts: u32,

    /// Messages processed concurrently.
    #[arg(long, env = "OPBUS_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Wire format of message bodies.
    #[arg(long, env = "OPBUS_CODEC", value_enum, default_value_t = CodecArg::Json)]
    codec: CodecArg,

    /// Console log format (pretty or json).
    #[arg(long, env = "OPBUS_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Seconds between transport lock renewals.
    #[arg(long, env = "OPBUS_LOCK_RENEWAL_SECS", default_value_t = 10)]
    lock_renewal_secs: u64,
}

// ---------------------------------------------------------------------------
// Deployment domain
// ---------------------------------------------------------------------------

/// Typed extension carried by Deploy requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeploySpec {
    image: String,
    replicas: u32,
    /// Attempts (by retry count) that fail before the rollout goes through.
    fail_attempts: u32,
}

#[derive(Debug, Clone)]
struct Deployment {
    image: String,
    replicas: u32,
    latest_operation_id: Option<String>,
}

impl Entity for Deployment {
    fn latest_operation_id(&self) -> Option<&str> {
        self.latest_operation_id.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct DeploymentStore {
    deployments: DashMap<String, Deployment>,
}

struct DeployOperation {
    store: Arc<DeploymentStore>,
    queue: Arc<InMemoryQueue>,
    codec: WireCodec,
    request: OperationRequest,
}

impl DeployOperation {
    fn new(store: Arc<DeploymentStore>, queue: Arc<InMemoryQueue>, codec: WireCodec) -> Self {
        Self {
            store,
            queue,
            codec,
            request: OperationRequest::default(),
        }
    }

    fn spec(&self) -> anyhow::Result<&DeploySpec> {
        self.request
            .extension::<DeploySpec>()
            .context("deploy spec was not bound at init")
    }
}

#[async_trait]
impl ApiOperation for DeployOperation {
    async fn init(&mut self, _ctx: &OperationContext, request: OperationRequest) -> anyhow::Result<()> {
        self.request = request;
        self.request.set_extension::<DeploySpec>()?;
        Ok(())
    }

    async fn entity_fetcher(&mut self, _ctx: &OperationContext) -> anyhow::Result<Box<dyn Entity>> {
        let deployment = self
            .store
            .deployments
            .get(&self.request.entity_id)
            .map(|entry| entry.value().clone())
            .with_context(|| format!("deployment {} not found", self.request.entity_id))?;
        Ok(Box::new(deployment))
    }

    async fn guard_concurrency(
        &mut self,
        _ctx: &OperationContext,
        entity: &dyn Entity,
    ) -> Result<(), CategorizedError> {
        latest_operation_guard(entity, &self.request)
    }

    async fn run(&mut self, _ctx: &OperationContext) -> OperationResult {
        let spec = match self.spec() {
            Ok(spec) => spec.clone(),
            Err(error) => return OperationResult::failed(500, error),
        };
        if self.request.retry_count < spec.fail_attempts {
            return OperationResult::failed(
                503,
                anyhow::anyhow!("image registry unavailable for {}", spec.image),
            );
        }

        if let Some(mut deployment) = self.store.deployments.get_mut(&self.request.entity_id) {
            deployment.image.clone_from(&spec.image);
            deployment.replicas = spec.replicas;
        }
        OperationResult::ok(format!("rolled out {} x{}", spec.image, spec.replicas))
    }

    async fn retry(&mut self, _ctx: &OperationContext) -> anyhow::Result<()> {
        requeue(self.queue.as_ref(), self.codec, &self.request).await
    }

    fn operation_request(&self) -> &OperationRequest {
        &self.request
    }

    fn operation_request_mut(&mut self) -> &mut OperationRequest {
        &mut self.request
    }

    fn name(&self) -> &str {
        "Deploy"
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

async fn wait_for_terminal(controller: &InMemoryController, expected: usize) {
    while controller.terminal_count() < expected {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, "info")?;

    let codec = WireCodec::from(args.codec);
    let config = ProcessorConfig {
        max_concurrency: args.concurrency,
        lock_renewal_interval: Duration::from_secs(args.lock_renewal_secs),
        codec,
        ..ProcessorConfig::default()
    };

    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(DeploymentStore::default());
    let registry = Arc::new(OperationRegistry::new());
    {
        let store = Arc::clone(&store);
        let queue = Arc::clone(&queue);
        registry.register("Deploy", move || {
            DeployOperation::new(Arc::clone(&store), Arc::clone(&queue), codec)
        });
    }
    let controller = Arc::new(InMemoryController::new());

    let mut operation_ids = Vec::new();
    for i in 0..args.operations {
        let entity_id = format!("web-{i}");
        let operation_id = format!("deploy-{i}");
        store.deployments.insert(
            entity_id.clone(),
            Deployment {
                image: "nginx:1.25".to_string(),
                replicas: 1,
                latest_operation_id: Some(operation_id.clone()),
            },
        );
        let request = OperationRequest::new("Deploy", "v1", &operation_id, &entity_id, "Deployment")
            .with_extension(DeploySpec {
                image: "nginx:1.27".to_string(),
                replicas: 3,
                fail_attempts: if i % 2 == 1 { args.flaky_attempts } else { 0 },
            });
        queue.enqueue(codec.encode(&request)?)?;
        operation_ids.push(operation_id);
    }

    let orphan = OperationRequest::new("Decommission", "v1", "decommission-0", "web-0", "Deployment");
    queue.enqueue(codec.encode(&orphan)?)?;
    operation_ids.push(orphan.operation_id.clone());

    let processor = Processor::new(queue.clone(), registry, controller.clone(), config);
    let lifecycle = processor.lifecycle();
    let running = tokio::spawn({
        let processor = processor.clone();
        async move { processor.run().await }
    });

    tokio::select! {
        () = wait_for_terminal(&controller, operation_ids.len()) => {
            info!("every operation reached a terminal status");
        }
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }
    queue.close();
    lifecycle.trigger_shutdown();
    running.await??;

    for operation_id in &operation_ids {
        let status = controller
            .status(operation_id)
            .map_or("unknown", |status| status.as_str());
        info!(operation_id = %operation_id, status, "final status");
    }
    for entry in &store.deployments {
        info!(
            deployment = %entry.key(),
            image = %entry.image,
            replicas = entry.replicas,
            "deployment state"
        );
    }
    Ok(())
}
