//! Stock concurrency guard policies.

use opbus_core::{CategorizedError, Entity, OperationRequest};

/// Allow the attempt only if the entity records no latest operation or records
/// this request's operation id. Any other recorded id means a different
/// operation owns the entity, and the attempt is blocked with a `Conflict`.
///
/// # Errors
///
/// Returns a `Conflict` `CategorizedError` naming both operation ids.
pub fn latest_operation_guard(
    entity: &dyn Entity,
    request: &OperationRequest,
) -> Result<(), CategorizedError> {
    match entity.latest_operation_id() {
        None => Ok(()),
        Some(latest) if latest.is_empty() || latest == request.operation_id => Ok(()),
        Some(latest) => Err(CategorizedError::conflict(format!(
            "{} {} is owned by operation {latest}, not {}",
            request.entity_type, request.entity_id, request.operation_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::ScriptedEntity;

    fn entity(latest: Option<&str>) -> ScriptedEntity {
        ScriptedEntity {
            serial: 0,
            latest_operation_id: latest.map(str::to_string),
        }
    }

    fn request() -> OperationRequest {
        OperationRequest::new("Deploy", "v1", "op-1", "cluster-1", "ManagedCluster")
    }

    #[test]
    fn allows_entity_without_recorded_operation() {
        assert!(latest_operation_guard(&entity(None), &request()).is_ok());
        assert!(latest_operation_guard(&entity(Some("")), &request()).is_ok());
    }

    #[test]
    fn allows_entity_owned_by_this_operation() {
        assert!(latest_operation_guard(&entity(Some("op-1")), &request()).is_ok());
    }

    #[test]
    fn blocks_entity_owned_by_another_operation() {
        let err = latest_operation_guard(&entity(Some("op-2")), &request()).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            err.message,
            "ManagedCluster cluster-1 is owned by operation op-2, not op-1"
        );
    }
}
