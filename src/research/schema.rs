//! Extraction schemas and the boundary check for structured output.
//!
//! The schema is data supplied per session, so extracted objects are checked
//! at runtime instead of being typed at compile time. Only the subset the
//! workflow relies on is enforced: the top level must be an object, required
//! properties must be present, and declared primitive types must match.

use serde_json::{json, Value};

/// The `CompanyInfo` schema used when the caller does not provide one.
pub fn default_extraction_schema() -> Value {
    json!({
        "title": "CompanyInfo",
        "description": "Basic information about a company",
        "type": "object",
        "properties": {
            "company_name": {
                "type": "string",
                "description": "Official name of the company"
            },
            "founding_year": {
                "type": "integer",
                "description": "Year the company was founded"
            },
            "founder_names": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Names of the founding team members"
            },
            "product_description": {
                "type": "string",
                "description": "Brief description of the company's main product or service"
            },
            "funding_summary": {
                "type": "string",
                "description": "Summary of the company's funding history"
            }
        },
        "required": ["company_name"]
    })
}

/// Output contract for the query generation step.
pub fn queries_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "queries": {
                "type": "array",
                "items": { "type": "string" },
                "description": "List of search queries."
            }
        },
        "required": ["queries"]
    })
}

/// Output contract for the note synthesis step.
pub fn notes_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "notes": {
                "type": "array",
                "items": { "type": "string" },
                "description": "List of research notes."
            }
        },
        "required": ["notes"]
    })
}

/// Output contract for the reflection step.
pub fn reflection_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "isSatisfactory": {
                "type": "boolean",
                "description": "True if all required fields are well populated, False otherwise"
            },
            "missingFields": {
                "type": "array",
                "items": { "type": "string" },
                "description": "List of field names that are missing or incomplete"
            },
            "searchQueries": {
                "type": "array",
                "items": { "type": "string" },
                "description": "If isSatisfactory is False, provide 1-3 targeted search queries to find the missing information"
            },
            "reasoning": {
                "type": "string",
                "description": "Brief explanation of the assessment"
            }
        },
        "required": ["isSatisfactory", "missingFields", "searchQueries", "reasoning"]
    })
}

/// Check `value` against `schema`. Returns a description of the first
/// violation found.
pub fn validate_against(schema: &Value, value: &Value) -> Result<(), String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected an object, got {}", json_type_name(value)))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required field '{}'", field));
                }
                Some(_) => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, property) in properties {
            let Some(field) = object.get(name) else {
                continue;
            };
            if field.is_null() {
                continue;
            }
            let Some(expected) = property.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !matches_type(expected, field) {
                return Err(format!(
                    "field '{}' should be {}, got {}",
                    name,
                    expected,
                    json_type_name(field)
                ));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown or composite types are not checked here
        _ => true,
    }
}

/// Get a human-readable type name for a JSON value.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_requires_company_name() {
        let schema = default_extraction_schema();
        assert_eq!(schema["title"], "CompanyInfo");
        assert_eq!(schema["required"], json!(["company_name"]));
    }

    #[test]
    fn test_validate_accepts_minimal_object() {
        let schema = default_extraction_schema();
        assert!(validate_against(&schema, &json!({"company_name": "Acme"})).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_object() {
        let err = validate_against(&default_extraction_schema(), &json!([1])).unwrap_err();
        assert!(err.contains("expected an object"));
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let err =
            validate_against(&default_extraction_schema(), &json!({"founding_year": 1999}))
                .unwrap_err();
        assert_eq!(err, "missing required field 'company_name'");
    }

    #[test]
    fn test_validate_rejects_null_required() {
        let err = validate_against(&default_extraction_schema(), &json!({"company_name": null}))
            .unwrap_err();
        assert!(err.contains("company_name"));
    }

    #[test]
    fn test_validate_rejects_wrong_primitive_type() {
        let err = validate_against(
            &default_extraction_schema(),
            &json!({"company_name": "Acme", "founding_year": "1999"}),
        )
        .unwrap_err();
        assert_eq!(err, "field 'founding_year' should be integer, got string");
    }

    #[test]
    fn test_validate_allows_optional_null() {
        assert!(validate_against(
            &default_extraction_schema(),
            &json!({"company_name": "Acme", "funding_summary": null}),
        )
        .is_ok());
    }

    #[test]
    fn test_validate_ignores_extra_fields() {
        assert!(validate_against(
            &default_extraction_schema(),
            &json!({"company_name": "Acme", "ticker": "ACME"}),
        )
        .is_ok());
    }

    #[test]
    fn test_reflection_schema_requires_all_fields() {
        let err = validate_against(&reflection_schema(), &json!({"isSatisfactory": true}))
            .unwrap_err();
        assert!(err.contains("missingFields"));
    }
}
