//! `opbus` Core: operation request envelope, run results, categorized guard
//! errors, the entity abstraction, and the wire codec.

pub mod codec;
pub mod entity;
pub mod error;
pub mod extension;
pub mod request;
pub mod result;

pub use codec::{CodecError, WireCodec};
pub use entity::Entity;
pub use error::{CategorizedError, ErrorCategory};
pub use extension::{Extension, ExtensionError, ExtensionValue};
pub use request::{OperationRequest, Timestamp, MAX_RETRY_COUNT};
pub use result::OperationResult;
