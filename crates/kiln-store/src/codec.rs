//! The single decode boundary for stored JSON.
//!
//! Values in the keyspace were written by more than one producer over time.
//! Most are canonical JSON; some older writers stored the JSON text as a
//! JSON string (double-encoded). [`decode`] tries both, in that order, and
//! only then reports [`StoreError::TypeMismatch`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Decode the raw value stored at `key`.
///
/// # Errors
///
/// Returns [`StoreError::TypeMismatch`] if neither the canonical nor the
/// double-encoded form decodes as `T`.
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    let canonical = match serde_json::from_str::<T>(raw) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Ok(inner) = serde_json::from_str::<String>(raw)
        && let Ok(value) = serde_json::from_str::<T>(&inner)
    {
        tracing::debug!(key, "Decoded double-encoded JSON value");
        return Ok(value);
    }

    Err(StoreError::TypeMismatch {
        key: key.to_owned(),
        reason: canonical.to_string(),
    })
}

/// Encode a value in canonical form.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct Sample {
        name: String,
        stage: u8,
    }

    #[test]
    fn canonical_form() {
        let sample: Sample = decode("k", r#"{"name":"a","stage":2}"#).unwrap();
        assert_eq!(sample.stage, 2);
    }

    #[test]
    fn double_encoded_form() {
        let raw = serde_json::to_string(r#"{"name":"b","stage":3}"#).unwrap();
        let sample: Sample = decode("k", &raw).unwrap();
        assert_eq!(sample.name, "b");
    }

    #[test]
    fn garbage_is_type_mismatch() {
        let err = decode::<Sample>("doc:project:9", "not json").unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { ref key, .. } if key == "doc:project:9"));
    }

    #[test]
    fn wrong_shape_is_type_mismatch() {
        let err = decode::<Sample>("k", r#"{"name":1}"#).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }
}
