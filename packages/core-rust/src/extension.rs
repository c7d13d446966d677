//! Operation-specific payload carried opaquely by the request envelope.
//!
//! On the wire the extension is an arbitrary structured value. Producers that
//! know the exact shape store a typed value; consumers convert whatever arrived
//! into the type they expect with [`Extension::convert`]:
//!
//! - a typed value that already is the target type is copied directly
//! - anything else is marshalled into the generic structured form
//!   (`serde_json::Value`) and unmarshalled as the target type
//! - an empty extension becomes the target type's default value

use std::any::{type_name, Any};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// ExtensionValue
// ---------------------------------------------------------------------------

/// A typed extension payload.
///
/// Implemented for every `Serialize + Clone + Debug + Send + Sync + 'static`
/// type, so operations never implement it by hand.
pub trait ExtensionValue: Any + Send + Sync + fmt::Debug {
    /// Marshal into the generic structured form used on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the value's `Serialize` impl fails.
    fn to_structured(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Clone behind a fresh box.
    fn clone_boxed(&self) -> Box<dyn ExtensionValue>;

    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T> ExtensionValue for T
where
    T: Serialize + Clone + Any + Send + Sync + fmt::Debug,
{
    fn to_structured(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn clone_boxed(&self) -> Box<dyn ExtensionValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ExtensionError
// ---------------------------------------------------------------------------

/// Errors from converting an extension between representations.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("failed to marshal extension into its generic form: {0}")]
    Marshal(#[source] serde_json::Error),
    #[error("extension cannot be converted into {target}: {source}")]
    Convert {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Extension
// ---------------------------------------------------------------------------

/// Operation-defined payload of an `OperationRequest`.
#[derive(Debug, Default)]
pub enum Extension {
    /// No extension was provided (`null` on the wire).
    #[default]
    Empty,
    /// Structured value as decoded from the wire, shape not yet known.
    Raw(serde_json::Value),
    /// Value of a concrete Rust type set by a producer or an operation.
    Typed(Box<dyn ExtensionValue>),
}

impl Extension {
    /// Wrap a concrete value.
    #[must_use]
    pub fn typed<T: ExtensionValue>(value: T) -> Self {
        Self::Typed(Box::new(value))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Borrow the typed value if it is exactly `T`.
    ///
    /// Raw values are never returned here; use [`Extension::convert`] first.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Typed(value) => value.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Marshal into the generic structured form. `Empty` becomes `null`.
    ///
    /// # Errors
    ///
    /// Returns `ExtensionError::Marshal` if a typed value fails to serialize.
    pub fn to_structured(&self) -> Result<serde_json::Value, ExtensionError> {
        match self {
            Self::Empty => Ok(serde_json::Value::Null),
            Self::Raw(value) => Ok(value.clone()),
            Self::Typed(value) => value.to_structured().map_err(ExtensionError::Marshal),
        }
    }

    /// Produce a `T` from whatever this extension currently holds.
    ///
    /// # Errors
    ///
    /// Returns `ExtensionError::Convert` if the structured form does not
    /// deserialize as `T`, or `ExtensionError::Marshal` if a typed value of
    /// another type cannot be serialized.
    pub fn convert<T>(&self) -> Result<T, ExtensionError>
    where
        T: ExtensionValue + DeserializeOwned + Clone + Default,
    {
        let structured = match self {
            Self::Empty => return Ok(T::default()),
            Self::Typed(value) => {
                if let Some(same) = value.as_any().downcast_ref::<T>() {
                    return Ok(same.clone());
                }
                tracing::debug!(
                    target_type = type_name::<T>(),
                    "extension type differs, converting through structured form"
                );
                value.to_structured().map_err(ExtensionError::Marshal)?
            }
            Self::Raw(value) => value.clone(),
        };
        serde_json::from_value(structured).map_err(|source| ExtensionError::Convert {
            target: type_name::<T>(),
            source,
        })
    }
}

impl Clone for Extension {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Raw(value) => Self::Raw(value.clone()),
            Self::Typed(value) => Self::Typed(value.clone_boxed()),
        }
    }
}

/// Extensions are equal when their structured forms are equal, regardless of
/// whether either side is still raw.
impl PartialEq for Extension {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_structured(), other.to_structured()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for Extension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty => serializer.serialize_none(),
            Self::Raw(value) => value.serialize(serializer),
            Self::Typed(value) => value
                .to_structured()
                .map_err(serde::ser::Error::custom)?
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Extension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(Self::Empty),
            Some(value) => Ok(Self::Raw(value)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct ScaleSpec {
        replicas: u32,
        #[serde(default)]
        zone: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct LegacyScaleSpec {
        replicas: u32,
        zone: String,
        deprecated_flag: bool,
    }

    #[test]
    fn get_returns_typed_value_of_matching_type() {
        let ext = Extension::typed(ScaleSpec {
            replicas: 3,
            zone: "eu".to_string(),
        });
        assert_eq!(ext.get::<ScaleSpec>().unwrap().replicas, 3);
        assert!(ext.get::<LegacyScaleSpec>().is_none());
    }

    #[test]
    fn get_ignores_raw_values() {
        let ext = Extension::Raw(json!({"replicas": 3}));
        assert!(ext.get::<ScaleSpec>().is_none());
    }

    #[test]
    fn convert_copies_same_type_directly() {
        let spec = ScaleSpec {
            replicas: 5,
            zone: "us".to_string(),
        };
        let ext = Extension::typed(spec.clone());
        assert_eq!(ext.convert::<ScaleSpec>().unwrap(), spec);
    }

    #[test]
    fn convert_raw_value_through_structured_form() {
        let ext = Extension::Raw(json!({"replicas": 2, "zone": "ap", "unknown": true}));
        let spec: ScaleSpec = ext.convert().unwrap();
        assert_eq!(
            spec,
            ScaleSpec {
                replicas: 2,
                zone: "ap".to_string()
            }
        );
    }

    #[test]
    fn convert_other_typed_value_through_structured_form() {
        let ext = Extension::typed(LegacyScaleSpec {
            replicas: 7,
            zone: "eu".to_string(),
            deprecated_flag: true,
        });
        let spec: ScaleSpec = ext.convert().unwrap();
        assert_eq!(spec.replicas, 7);
        assert_eq!(spec.zone, "eu");
    }

    #[test]
    fn convert_empty_yields_default() {
        let spec: ScaleSpec = Extension::Empty.convert().unwrap();
        assert_eq!(spec, ScaleSpec::default());
    }

    #[test]
    fn convert_incompatible_shape_fails() {
        let ext = Extension::Raw(json!({"replicas": "many"}));
        let err = ext.convert::<ScaleSpec>().unwrap_err();
        assert!(matches!(err, ExtensionError::Convert { .. }));
        assert!(err.to_string().contains("ScaleSpec"));
    }

    #[test]
    fn raw_and_typed_with_same_shape_are_equal() {
        let typed = Extension::typed(ScaleSpec {
            replicas: 1,
            zone: "eu".to_string(),
        });
        let raw = Extension::Raw(json!({"replicas": 1, "zone": "eu"}));
        assert_eq!(typed, raw);
        assert_ne!(typed, Extension::Empty);
    }

    #[test]
    fn null_deserializes_to_empty() {
        let ext: Extension = serde_json::from_str("null").unwrap();
        assert!(ext.is_empty());
        assert_eq!(serde_json::to_string(&Extension::Empty).unwrap(), "null");
    }

    #[test]
    fn clone_of_typed_is_independent() {
        let ext = Extension::typed(ScaleSpec {
            replicas: 1,
            zone: String::new(),
        });
        let copy = ext.clone();
        assert_eq!(copy.get::<ScaleSpec>(), ext.get::<ScaleSpec>());
    }
}
