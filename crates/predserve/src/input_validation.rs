//! Record validation against the OpenAPI schema.
//!
//! Every record reaches the prediction engine through this validator, whether
//! it arrived as a JSON request body or as a CSV row inside a batch upload.
//! Errors come back per field in the pydantic-style shape clients expect.

use std::collections::HashSet;

use csv::StringRecord;
use serde_json::{Map, Value};

use crate::schema::{FIELDS, PredictionRecord, RECORD_SCHEMA_KEY, cell_to_value};

/// A single validation error for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Field name (used as loc[1] in the pydantic-compatible response).
    pub field: String,
    /// Human-readable error message.
    pub msg: String,
    /// Error type string (e.g. "value_error.missing").
    pub error_type: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, msg: impl Into<String>, error_type: &str) -> Self {
        Self {
            field: field.into(),
            msg: msg.into(),
            error_type: error_type.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "field '{}': {}", self.field, self.msg)
    }
}

/// Compiled record validator built from the OpenAPI schema's record component.
pub struct InputValidator {
    validator: jsonschema::Validator,
    /// Known property names from the schema.
    properties: HashSet<String>,
    /// Required field names from the schema.
    required: Vec<String>,
}

impl InputValidator {
    /// Build a validator from a full OpenAPI schema document.
    ///
    /// Extracts `components.schemas.PredictionRecord`, injects
    /// `additionalProperties: false`, and compiles a JSON Schema validator.
    ///
    /// Returns None if the schema doesn't contain the record component.
    pub fn from_openapi_schema(schema: &Value) -> Option<Self> {
        Self::from_openapi_schema_key(schema, RECORD_SCHEMA_KEY)
    }

    /// Build a validator for an arbitrary component of an OpenAPI document.
    pub fn from_openapi_schema_key(schema: &Value, key: &str) -> Option<Self> {
        let input_schema = schema.get("components")?.get("schemas")?.get(key)?;

        let properties: HashSet<String> = input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();

        let required: Vec<String> = input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut resolved = input_schema.clone();
        if let Some(obj) = resolved.as_object_mut() {
            obj.insert("additionalProperties".to_string(), Value::Bool(false));
            // Documentation-only keys the validator has no use for.
            obj.remove("example");
        }

        // Categorical fields point at enum components via $ref; inline them so
        // the validator works without the rest of the document.
        let all_schemas = schema.get("components").and_then(|c| c.get("schemas"));
        inline_refs(&mut resolved, all_schemas);

        let validator = jsonschema::validator_for(&resolved)
            .inspect_err(|e| {
                tracing::warn!(error = %e, "Failed to compile record schema validator");
            })
            .ok()?;

        Some(Self {
            validator,
            properties,
            required,
        })
    }

    /// Validator for the built-in record schema.
    pub fn for_records() -> Self {
        Self::from_openapi_schema(&crate::schema::openapi_document())
            .expect("built-in record schema compiles")
    }

    pub fn required_count(&self) -> usize {
        self.required.len()
    }

    /// Validate an input value against the schema.
    ///
    /// Returns Ok(()) on success, or a list of per-field validation errors.
    pub fn validate(&self, input: &Value) -> Result<(), Vec<ValidationError>> {
        if self.validator.is_valid(input) {
            return Ok(());
        }

        if !input.is_object() {
            return Err(vec![ValidationError::new(
                "__root__",
                "Input should be a JSON object",
                "type_error.dict",
            )]);
        }

        let mut errors = Vec::new();
        let mut seen_required = false;
        let mut seen_additional = false;

        for error in self.validator.iter_errors(input) {
            let msg = error.to_string();

            // One entry per missing field, in schema order.
            if msg.contains("is a required property") {
                if !seen_required {
                    seen_required = true;
                    let input_obj = input.as_object();
                    for field in &self.required {
                        let present = input_obj
                            .map(|obj| obj.contains_key(field))
                            .unwrap_or(false);
                        if !present {
                            errors.push(ValidationError::new(
                                field.clone(),
                                "Field required",
                                "value_error.missing",
                            ));
                        }
                    }
                }
                continue;
            }

            // One entry per unknown field.
            if msg.contains("Additional properties") {
                if !seen_additional {
                    seen_additional = true;
                    if let Some(input_obj) = input.as_object() {
                        for key in input_obj.keys() {
                            if !self.properties.contains(key) {
                                errors.push(ValidationError::new(
                                    key.clone(),
                                    format!("Unexpected field '{key}'"),
                                    "value_error.extra",
                                ));
                            }
                        }
                    }
                }
                continue;
            }

            let path = error.instance_path().to_string();
            let field = path.trim_start_matches('/');
            let field_name = if field.is_empty() {
                "__root__".to_string()
            } else {
                field.to_string()
            };
            errors.push(ValidationError::new(field_name, msg, "value_error"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a JSON value and convert it into a typed record.
    pub fn validate_record(&self, input: &Value) -> Result<PredictionRecord, Vec<ValidationError>> {
        self.validate(input)?;
        serde_json::from_value(input.clone())
            .map_err(|e| vec![ValidationError::new("__root__", e.to_string(), "type_error")])
    }

    /// Validate one CSV row, reading fields through `columns`.
    ///
    /// Only schema fields are read; extra columns are left to the caller.
    pub fn validate_row(
        &self,
        columns: &ColumnMap,
        row: &StringRecord,
    ) -> Result<PredictionRecord, Vec<ValidationError>> {
        let mut object = Map::new();
        for (spec, index) in FIELDS.iter().zip(&columns.indices) {
            let cell = index.and_then(|i| row.get(i));
            if let Some(value) = cell.and_then(|c| cell_to_value(spec, c)) {
                object.insert(spec.name.to_string(), value);
            }
        }
        self.validate_record(&Value::Object(object))
    }
}

/// Position of each schema field within a CSV header row.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    /// One entry per schema field, in schema order. `None` when the column is absent.
    indices: Vec<Option<usize>>,
}

impl ColumnMap {
    pub fn from_headers(headers: &StringRecord) -> Self {
        let indices = FIELDS
            .iter()
            .map(|spec| headers.iter().position(|h| h.trim() == spec.name))
            .collect();
        Self { indices }
    }

    /// Schema fields missing from the header row.
    pub fn missing(&self) -> Vec<&'static str> {
        FIELDS
            .iter()
            .zip(&self.indices)
            .filter(|(_, index)| index.is_none())
            .map(|(spec, _)| spec.name)
            .collect()
    }
}

/// Recursively inline `$ref` pointers in a JSON Schema value.
///
/// Resolves `{"$ref": "#/components/schemas/Foo"}` by looking up `Foo` in the
/// provided schemas map and replacing the `$ref` object with the referenced
/// content.
fn inline_refs(value: &mut Value, all_schemas: Option<&Value>) {
    match value {
        Value::Object(obj) => {
            if let Some(Value::String(ref_str)) = obj.get("$ref")
                && let Some(resolved) = resolve_ref(ref_str, all_schemas)
            {
                *value = resolved;
                inline_refs(value, all_schemas);
                return;
            }
            for v in obj.values_mut() {
                inline_refs(v, all_schemas);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                inline_refs(v, all_schemas);
            }
        }
        _ => {}
    }
}

/// Resolve a `$ref` string like `#/components/schemas/Foo` against the schemas map.
fn resolve_ref(ref_str: &str, all_schemas: Option<&Value>) -> Option<Value> {
    let name = ref_str.strip_prefix("#/components/schemas/")?;
    all_schemas?.get(name).cloned()
}
