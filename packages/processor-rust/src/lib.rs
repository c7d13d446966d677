//! `opbus` Processor: turns queue messages into executions of long-running,
//! resumable operations with bounded retry and per-entity concurrency guards.

pub mod controller;
pub mod lifecycle;
pub mod logging;
pub mod service;
pub mod traits;
pub mod transport;

pub use controller::{InMemoryController, NoopController};
pub use lifecycle::{LifecycleController, ProcessorState};
pub use service::{
    ApiOperation, Disposition, OperationContext, OperationRegistry, Processor, ProcessorConfig,
    StageError,
};
pub use traits::{MessageReceiver, MessageSender, OperationController, OperationStatus, ReceivedMessage};
pub use transport::InMemoryQueue;
