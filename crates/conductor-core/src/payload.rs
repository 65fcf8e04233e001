use crate::{ConductorError, ConductorResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Schema-less map exchanged with step functions and task handlers.
pub type Payload = serde_json::Map<String, Value>;

/// Convert a JSON value into a [`Payload`].
///
/// Objects are used as-is; any other value is wrapped under a `"value"` key.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Serialize a typed struct into a [`Payload`] at a handler boundary.
pub fn to_payload<T: Serialize>(value: &T) -> ConductorResult<Payload> {
    Ok(into_payload(serde_json::to_value(value)?))
}

/// Deserialize a [`Payload`] into the handler's typed input.
pub fn from_payload<T: DeserializeOwned>(payload: &Payload) -> ConductorResult<T> {
    serde_json::from_value(Value::Object(payload.clone())).map_err(ConductorError::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct LeadInput {
        lead_id: String,
        score: u32,
    }

    #[test]
    fn typed_struct_through_payload() {
        let input = LeadInput {
            lead_id: "L-42".into(),
            score: 87,
        };
        let payload = to_payload(&input).unwrap();
        assert_eq!(payload["lead_id"], json!("L-42"));
        let back: LeadInput = from_payload(&payload).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn scalar_values_are_wrapped() {
        let payload = into_payload(json!(7));
        assert_eq!(payload["value"], json!(7));
        assert!(into_payload(Value::Null).is_empty());
    }

    #[test]
    fn mismatched_shape_is_a_json_error() {
        let payload = into_payload(json!({"lead_id": 5}));
        let err = from_payload::<LeadInput>(&payload).unwrap_err();
        assert!(matches!(err, ConductorError::Json(_)));
    }
}
