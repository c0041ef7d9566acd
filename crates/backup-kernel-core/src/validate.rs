use serde_json::Value;

/// Cheap plausibility gate run before migration.
///
/// Accepts the legacy array shape, anything carrying a numeric
/// `schemaVersion`, or anything carrying an `archives` array. False positives
/// are tolerated; the migrator sanitizes whatever gets through.
#[must_use]
pub fn validate(input: &Value) -> bool {
    match input {
        Value::Array(_) => true,
        Value::Object(map) => {
            map.get("schemaVersion").is_some_and(Value::is_number)
                || map.get("archives").is_some_and(Value::is_array)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_each_signal_independently() {
        assert!(validate(&json!([])));
        assert!(validate(&json!({"schemaVersion": 2})));
        assert!(validate(&json!({"archives": []})));
        assert!(validate(&json!({"schemaVersion": "x", "archives": [{}]})));
    }

    #[test]
    fn rejects_implausible_input() {
        assert!(!validate(&json!(null)));
        assert!(!validate(&json!("backup")));
        assert!(!validate(&json!(3)));
        assert!(!validate(&json!({})));
        assert!(!validate(&json!({"schemaVersion": "3"})));
        assert!(!validate(&json!({"archives": {"a": 1}})));
    }
}
