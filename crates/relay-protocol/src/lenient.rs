//! Best-effort field deserializers.
//!
//! Payload fields never fail decoding: a value of the wrong JSON type is
//! replaced by the field's zero value.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Deserializes `T`, falling back to `T::default()` on a type mismatch.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Deserializes an integer field.
///
/// Accepts JSON integers and finite floats (truncated toward zero, saturating
/// at the `i64` bounds). Anything else becomes `0`.
pub(crate) fn lenient_int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_int(&value))
}

fn coerce_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_int_accepts_integers_and_floats() {
        assert_eq!(coerce_int(&json!(7)), 7);
        assert_eq!(coerce_int(&json!(-3)), -3);
        assert_eq!(coerce_int(&json!(7.9)), 7);
        assert_eq!(coerce_int(&json!(-7.9)), -7);
    }

    #[test]
    fn test_coerce_int_rejects_other_types() {
        assert_eq!(coerce_int(&json!("7")), 0);
        assert_eq!(coerce_int(&json!(null)), 0);
        assert_eq!(coerce_int(&json!(true)), 0);
        assert_eq!(coerce_int(&json!([1])), 0);
    }

    #[test]
    fn test_coerce_int_saturates_large_values() {
        assert_eq!(coerce_int(&json!(u64::MAX)), i64::MAX);
    }
}
