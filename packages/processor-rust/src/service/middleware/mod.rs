//! Tower middleware layers for the message pipeline.
//!
//! - [`metrics`]: per-delivery span, disposition counter, and duration histogram
//! - [`lock_renewal`]: transport lock renewal, cancelling the delivery on loss
//! - [`pipeline`]: composes the layers around the `MessageHandler`

pub mod lock_renewal;
pub mod metrics;
pub mod pipeline;

pub use lock_renewal::LockRenewalLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_message_pipeline, MessagePipeline};
