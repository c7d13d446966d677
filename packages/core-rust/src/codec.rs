//! Wire codec for the operation request envelope.
//!
//! JSON is the default and matches what existing producers emit. `MsgPack`
//! uses named (map) encoding via `rmp_serde::to_vec_named()` so fields can be
//! added or ignored the same way as in JSON.

use crate::request::OperationRequest;

/// Errors from encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Serialization format of message bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireCodec {
    #[default]
    Json,
    MsgPack,
}

impl WireCodec {
    /// Serialize a request into a message body.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the request (typically its typed extension)
    /// fails to serialize.
    pub fn encode(self, request: &OperationRequest) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(request)?),
            Self::MsgPack => Ok(rmp_serde::to_vec_named(request)?),
        }
    }

    /// Deserialize a message body into a request.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the body is not a valid envelope.
    pub fn decode(self, body: &[u8]) -> Result<OperationRequest, CodecError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(body)?),
            Self::MsgPack => Ok(rmp_serde::from_slice(body)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct UpgradeSpec {
        target_version: String,
        surge: u32,
    }

    fn full_request() -> OperationRequest {
        OperationRequest::new("Upgrade", "v1", "op-42", "cluster-1", "ManagedCluster")
            .with_retry_count(3)
            .with_expiration(UNIX_EPOCH + Duration::new(1_800_000_000, 500))
            .with_body(vec![0, 1, 2, 255], "POST")
            .with_extension(UpgradeSpec {
                target_version: "1.30".to_string(),
                surge: 2,
            })
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let req = full_request();
        let bytes = WireCodec::Json.encode(&req).unwrap();
        let mut decoded = WireCodec::Json.decode(&bytes).unwrap();
        assert_eq!(decoded, req);
        decoded.set_extension::<UpgradeSpec>().unwrap();
        assert_eq!(decoded.extension::<UpgradeSpec>().unwrap().surge, 2);
    }

    #[test]
    fn msgpack_round_trip_preserves_fields() {
        let req = full_request();
        let bytes = WireCodec::MsgPack.encode(&req).unwrap();
        let mut decoded = WireCodec::MsgPack.decode(&bytes).unwrap();
        assert_eq!(decoded, req);
        decoded.set_extension::<UpgradeSpec>().unwrap();
        assert_eq!(
            decoded.extension::<UpgradeSpec>().unwrap().target_version,
            "1.30"
        );
    }

    #[test]
    fn malformed_body_fails_to_decode() {
        assert!(matches!(
            WireCodec::Json.decode(b"{not json"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            WireCodec::MsgPack.decode(&[0xc1]),
            Err(CodecError::MsgPackDecode(_))
        ));
    }

    proptest! {
        #[test]
        fn json_round_trip_for_arbitrary_envelopes(
            name in "[A-Za-z]{1,12}",
            id in "[a-z0-9-]{1,24}",
            retry in 0u32..=10,
            body in proptest::collection::vec(any::<u8>(), 0..64),
            seconds in 0i64..4_000_000_000,
        ) {
            let req = OperationRequest::new(name, "v1", id, "e", "t")
                .with_retry_count(retry)
                .with_body(body, "")
                .with_expiration(UNIX_EPOCH + Duration::from_secs(seconds.unsigned_abs()));
            let decoded = WireCodec::Json.decode(&WireCodec::Json.encode(&req).unwrap()).unwrap();
            prop_assert_eq!(decoded, req);
        }
    }
}
