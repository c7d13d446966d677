//! The resource an operation acts on.

use std::any::Any;
use std::fmt;

/// Opaque handle to the targeted domain resource, fetched fresh per attempt.
///
/// Guards inspect `latest_operation_id` to decide whether another operation
/// owns the entity; operations downcast through `as_any` to reach their own
/// entity type.
pub trait Entity: Send + Sync + fmt::Debug {
    /// Id of the operation most recently recorded against this entity.
    fn latest_operation_id(&self) -> Option<&str>;

    fn as_any(&self) -> &dyn Any;
}
