//! Operation service layer: registry, lifecycle contract, message pipeline,
//! and the receive loop that drives it.

pub mod classify;
pub mod config;
pub mod guard;
pub mod handler;
pub mod middleware;
pub mod notify;
pub mod operation;
pub mod processor;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use classify::{classify, Action, Disposition};
pub use config::ProcessorConfig;
pub use guard::latest_operation_guard;
pub use handler::{Delivery, MessageHandler};
pub use notify::StatusNotifier;
pub use operation::{ApiOperation, ContextError, OperationContext, Stage, StageError};
pub use processor::Processor;
pub use registry::{OperationFactory, OperationRegistry, RegistryEntry, RegistryError};
