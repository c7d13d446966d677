//! The operation request envelope carried on the wire and through the pipeline.
//!
//! Field names serialize in `PascalCase` (with `APIVersion` spelled out) so the
//! envelope stays wire-compatible with existing producers. `Body` travels as a
//! base64 string and `ExpirationTimestamp` as `{seconds, nanos}`. Unknown
//! fields are ignored on decode and every field is optional.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::extension::{Extension, ExtensionError, ExtensionValue};

/// Retry ceiling. A request whose retry count has reached this value is never
/// executed again.
pub const MAX_RETRY_COUNT: u32 = 10;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Wall-clock instant as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// Convert a `SystemTime`. Instants before the epoch clamp to the epoch.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX),
            nanos: i32::try_from(since_epoch.subsec_nanos()).unwrap_or(0),
        }
    }

    /// Convert back to a `SystemTime`. Negative components clamp to zero.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let seconds = u64::try_from(self.seconds).unwrap_or(0);
        let nanos = u32::try_from(self.nanos).unwrap_or(0);
        UNIX_EPOCH + Duration::new(seconds, nanos)
    }
}

// ---------------------------------------------------------------------------
// OperationRequest
// ---------------------------------------------------------------------------

/// Everything an operation needs to execute, carried across delivery attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct OperationRequest {
    /// Registry key used to pick the concrete operation type.
    pub operation_name: String,
    /// API version the operation is associated with.
    #[serde(rename = "APIVersion")]
    pub api_version: String,
    /// Number of delivery attempts that already failed. Incremented only by
    /// the pipeline's retry path.
    pub retry_count: u32,
    /// Unique identifier of the logical operation.
    pub operation_id: String,
    /// Identifier of the targeted resource, paired with `entity_type`.
    pub entity_id: String,
    /// Type of the targeted resource, paired with `entity_id`.
    pub entity_type: String,
    /// The operation must not execute after this instant.
    pub expiration_timestamp: Option<Timestamp>,
    /// Opaque payload bytes.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    /// Optional method hint for HTTP-shaped operations.
    pub http_method: String,
    /// Operation-defined payload.
    pub extension: Extension,
}

impl OperationRequest {
    /// Create a request for a fresh logical operation (retry count 0).
    #[must_use]
    pub fn new(
        operation_name: impl Into<String>,
        api_version: impl Into<String>,
        operation_id: impl Into<String>,
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            operation_name: operation_name.into(),
            api_version: api_version.into(),
            operation_id: operation_id.into(),
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_expiration(mut self, expires_at: SystemTime) -> Self {
        self.expiration_timestamp = Some(Timestamp::from_system_time(expires_at));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>, http_method: impl Into<String>) -> Self {
        self.body = body.into();
        self.http_method = http_method.into();
        self
    }

    #[must_use]
    pub fn with_extension<T: ExtensionValue>(mut self, extension: T) -> Self {
        self.extension = Extension::typed(extension);
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Deadline derived from the expiration timestamp, if any.
    #[must_use]
    pub fn expiration_deadline(&self) -> Option<SystemTime> {
        self.expiration_timestamp.map(Timestamp::to_system_time)
    }

    /// Whether the expiration timestamp lies at or before `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiration_deadline()
            .is_some_and(|deadline| deadline <= now)
    }

    /// Whether the retry ceiling has been reached.
    #[must_use]
    pub fn has_reached_retry_limit(&self) -> bool {
        self.retry_count >= MAX_RETRY_COUNT
    }

    /// Replace the extension with a value of type `T`, carrying over whatever
    /// the current extension holds (see [`Extension::convert`]).
    ///
    /// # Errors
    ///
    /// Returns an `ExtensionError` if the current extension cannot be
    /// converted into `T`. The extension is left unchanged in that case.
    pub fn set_extension<T>(&mut self) -> Result<(), ExtensionError>
    where
        T: ExtensionValue + DeserializeOwned + Clone + Default,
    {
        let converted: T = self.extension.convert()?;
        self.extension = Extension::typed(converted);
        Ok(())
    }

    /// Borrow the extension as `T` if it has already been set to that type.
    #[must_use]
    pub fn extension<T: 'static>(&self) -> Option<&T> {
        self.extension.get::<T>()
    }
}

// ---------------------------------------------------------------------------
// base64 body encoding
// ---------------------------------------------------------------------------

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(body: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    /// `null` and absent bodies both decode as empty.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
