use serde_json::Value;

/// Decides whether a request payload is acceptable for a command.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> bool;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn validate(&self, payload: &Value) -> bool {
        self(payload)
    }
}

/// Validates payloads against a compiled JSON Schema.
pub struct SchemaValidator {
    validator: jsonschema::Validator,
}

impl SchemaValidator {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        jsonschema::validator_for(schema)
            .map(|validator| Self { validator })
            .map_err(|err| err.to_string())
    }
}

impl PayloadValidator for SchemaValidator {
    fn validate(&self, payload: &Value) -> bool {
        self.validator.is_valid(payload)
    }
}

/// Used when a command declares no payload schema.
pub struct AcceptAny;

impl PayloadValidator for AcceptAny {
    fn validate(&self, _payload: &Value) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_validator_checks_required_keys() {
        let validator = SchemaValidator::compile(&json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {"a": {"type": "string"}, "b": {"type": "string"}}
        }))
        .unwrap();

        assert!(validator.validate(&json!({"a": "1", "b": "2"})));
        assert!(!validator.validate(&json!({"a": "1"})));
        assert!(!validator.validate(&json!("a")));
    }

    #[test]
    fn closures_are_validators() {
        let only_objects = |payload: &Value| payload.is_object();
        assert!(only_objects.validate(&json!({})));
        assert!(!only_objects.validate(&json!([])));
        assert!(AcceptAny.validate(&Value::Null));
    }
}
