// SPDX-License-Identifier: MIT
//! JSON Schema validation registry.
//!
//! Holds a compiled `jsonschema` validator per `(action, message_type)` pair
//! and classifies validation failures by inspecting the error string, rather
//! than matching on `jsonschema`'s `ValidationErrorKind` variants — the same
//! string-classification style this codebase already uses for its own RPC
//! error mapping.

use std::collections::HashMap;
use std::sync::RwLock;

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::errors::{OcppError, OcppErrorCode};

/// Which side of a CALL a schema applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    /// The `payload` of a CALL for this action (the request).
    Request,
    /// The `payload` of a CALLRESULT for this action (the response).
    Response,
}

/// Registry of compiled schemas, keyed by `(action, kind)`.
///
/// Actions with no registered schema are allowed through unvalidated — this
/// mirrors the spec's own stance that unknown/custom actions aren't a
/// protocol violation by themselves.
pub struct ValidatorRegistry {
    schemas: RwLock<HashMap<(String, SchemaKind), JSONSchema>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Compile and register a schema for `action`/`kind`.
    ///
    /// Returns an error if `schema` is not a valid draft 2020-12 document.
    pub fn register(&self, action: &str, kind: SchemaKind, schema: &Value) -> Result<(), OcppError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(schema)
            .map_err(|e| {
                OcppError::new(
                    OcppErrorCode::InternalError,
                    format!("invalid schema for {action}: {e}"),
                )
            })?;
        self.schemas
            .write()
            .expect("validator registry lock poisoned")
            .insert((action.to_string(), kind), compiled);
        Ok(())
    }

    /// Validate `payload` against the registered schema for `action`/`kind`.
    ///
    /// Returns `Ok(())` when no schema is registered for this pair.
    pub fn validate(&self, action: &str, kind: SchemaKind, payload: &Value) -> Result<(), OcppError> {
        let schemas = self.schemas.read().expect("validator registry lock poisoned");
        let Some(validator) = schemas.get(&(action.to_string(), kind)) else {
            return Ok(());
        };

        if let Err(mut errors) = validator.validate(payload) {
            let message = errors.next().map(|e| e.to_string()).unwrap_or_default();
            let code = classify_validation_error(&message);
            return Err(OcppError::new(code, message));
        }
        Ok(())
    }

    pub fn has_schema(&self, action: &str, kind: SchemaKind) -> bool {
        self.schemas
            .read()
            .expect("validator registry lock poisoned")
            .contains_key(&(action.to_string(), kind))
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a `jsonschema` error message to the closest OCPP error code by
/// inspecting the message text, the same way this codebase classifies its
/// own internal RPC errors by string prefix. Follows the diagnostic table:
/// required/additional property -> occurrence, type mismatch -> type,
/// enum/const/minimum/maximum -> property, format/length -> format.
fn classify_validation_error(message: &str) -> OcppErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("required property") || lower.contains("is a required property") || lower.contains("additional properties") {
        OcppErrorCode::OccurrenceConstraintViolation
    } else if lower.contains("is not of type") || lower.contains("is not valid under") {
        OcppErrorCode::TypeConstraintViolation
    } else if lower.contains("is not one of")
        || lower.contains("is not a valid enum")
        || lower.contains("is greater than")
        || lower.contains("is less than")
        || lower.contains("const")
    {
        OcppErrorCode::PropertyConstraintViolation
    } else if lower.contains("is longer than")
        || lower.contains("is shorter than")
        || lower.contains("does not match")
        || lower.contains("format")
    {
        OcppErrorCode::FormatViolation
    } else {
        OcppErrorCode::FormationViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "connectorId": { "type": "integer", "minimum": 1 },
                "idTag": { "type": "string", "maxLength": 20 }
            },
            "required": ["connectorId", "idTag"]
        })
    }

    #[test]
    fn unregistered_action_passes_through() {
        let reg = ValidatorRegistry::new();
        let result = reg.validate("Unknown", SchemaKind::Request, &json!({"anything": true}));
        assert!(result.is_ok());
    }

    #[test]
    fn valid_payload_passes() {
        let reg = ValidatorRegistry::new();
        reg.register("Authorize", SchemaKind::Request, &sample_schema()).unwrap();
        let result = reg.validate(
            "Authorize",
            SchemaKind::Request,
            &json!({"connectorId": 1, "idTag": "ABC123"}),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn missing_required_property_is_occurrence_violation() {
        let reg = ValidatorRegistry::new();
        reg.register("Authorize", SchemaKind::Request, &sample_schema()).unwrap();
        let result = reg.validate("Authorize", SchemaKind::Request, &json!({"connectorId": 1}));
        let err = result.unwrap_err();
        assert_eq!(err.code, OcppErrorCode::OccurrenceConstraintViolation);
    }

    #[test]
    fn too_long_string_is_format_violation() {
        let reg = ValidatorRegistry::new();
        reg.register("Authorize", SchemaKind::Request, &sample_schema()).unwrap();
        let result = reg.validate(
            "Authorize",
            SchemaKind::Request,
            &json!({"connectorId": 1, "idTag": "x".repeat(40)}),
        );
        let err = result.unwrap_err();
        assert_eq!(err.code, OcppErrorCode::FormatViolation);
    }

    #[test]
    fn wrong_type_is_type_constraint_violation() {
        let reg = ValidatorRegistry::new();
        reg.register("Authorize", SchemaKind::Request, &sample_schema()).unwrap();
        let result = reg.validate(
            "Authorize",
            SchemaKind::Request,
            &json!({"connectorId": "one", "idTag": "ABC123"}),
        );
        let err = result.unwrap_err();
        assert_eq!(err.code, OcppErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn request_and_response_schemas_are_independent() {
        let reg = ValidatorRegistry::new();
        reg.register("Authorize", SchemaKind::Request, &sample_schema()).unwrap();
        assert!(reg.has_schema("Authorize", SchemaKind::Request));
        assert!(!reg.has_schema("Authorize", SchemaKind::Response));
    }
}
