//! Prediction input schema.
//!
//! The field table below is the single description of a [`PredictionRecord`].
//! It produces the OpenAPI document served at `/openapi.json`, which in turn
//! compiles into the validator used for both JSON requests and CSV rows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Component name of the record schema inside the OpenAPI document.
pub const RECORD_SCHEMA_KEY: &str = "PredictionRecord";

/// Shape of a single input field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    /// Categorical field, validated against a named enum component.
    Categorical {
        component: &'static str,
        choices: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
}

const JOBS: &[&str] = &[
    "admin.",
    "blue-collar",
    "entrepreneur",
    "housemaid",
    "management",
    "retired",
    "self-employed",
    "services",
    "student",
    "technician",
    "unemployed",
    "unknown",
];
const MARITAL: &[&str] = &["divorced", "married", "single", "unknown"];
const EDUCATION: &[&str] = &[
    "basic.4y",
    "basic.6y",
    "basic.9y",
    "high.school",
    "illiterate",
    "professional.course",
    "university.degree",
    "unknown",
];
const YES_NO_UNKNOWN: &[&str] = &["no", "yes", "unknown"];
const CONTACT: &[&str] = &["cellular", "telephone"];
const MONTHS: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const POUTCOME: &[&str] = &["failure", "nonexistent", "other", "success"];

const fn int(minimum: Option<i64>, maximum: Option<i64>) -> FieldKind {
    FieldKind::Integer { minimum, maximum }
}

const fn spec(name: &'static str, kind: FieldKind, description: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        description,
    }
}

const fn cat(component: &'static str, choices: &'static [&'static str]) -> FieldKind {
    FieldKind::Categorical { component, choices }
}

/// All record fields in column order.
pub const FIELDS: &[FieldSpec] = &[
    spec("age", int(None, None), "Age of the client"),
    spec("job", cat("Job", JOBS), "Type of job"),
    spec("marital", cat("Marital", MARITAL), "Marital status"),
    spec("education", cat("Education", EDUCATION), "Education level"),
    spec("default", cat("YesNoUnknown", YES_NO_UNKNOWN), "Has credit in default?"),
    spec("balance", int(None, None), "Average yearly balance, in euros"),
    spec("housing", cat("YesNoUnknown", YES_NO_UNKNOWN), "Has housing loan?"),
    spec("loan", cat("YesNoUnknown", YES_NO_UNKNOWN), "Has personal loan?"),
    spec("contact", cat("Contact", CONTACT), "Contact communication type"),
    spec("day", int(Some(1), Some(31)), "Last contact day of month"),
    spec("month", cat("Month", MONTHS), "Last contact month of year"),
    spec("duration", int(Some(0), None), "Last contact duration in seconds"),
    spec("campaign", int(Some(1), None), "Contacts performed during this campaign"),
    spec("pdays", int(None, None), "Days since a previous campaign contact (999 = never)"),
    spec("previous", int(Some(0), None), "Contacts performed before this campaign"),
    spec("poutcome", cat("Poutcome", POUTCOME), "Outcome of the previous marketing campaign"),
];

pub fn field(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|f| f.name == name)
}

/// One validated row of model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub age: i64,
    pub job: String,
    pub marital: String,
    pub education: String,
    pub default: String,
    pub balance: i64,
    pub housing: String,
    pub loan: String,
    pub contact: String,
    pub day: i64,
    pub month: String,
    pub duration: i64,
    pub campaign: i64,
    pub pdays: i64,
    pub previous: i64,
    pub poutcome: String,
}

impl PredictionRecord {
    /// Numeric feature value by field name.
    pub fn integer(&self, name: &str) -> Option<i64> {
        match name {
            "age" => Some(self.age),
            "balance" => Some(self.balance),
            "day" => Some(self.day),
            "duration" => Some(self.duration),
            "campaign" => Some(self.campaign),
            "pdays" => Some(self.pdays),
            "previous" => Some(self.previous),
            _ => None,
        }
    }

    /// Categorical feature value by field name.
    pub fn category(&self, name: &str) -> Option<&str> {
        match name {
            "job" => Some(&self.job),
            "marital" => Some(&self.marital),
            "education" => Some(&self.education),
            "default" => Some(&self.default),
            "housing" => Some(&self.housing),
            "loan" => Some(&self.loan),
            "contact" => Some(&self.contact),
            "month" => Some(&self.month),
            "poutcome" => Some(&self.poutcome),
            _ => None,
        }
    }
}

/// Convert one CSV cell into the JSON value the validator expects.
///
/// Integers that fail to parse stay strings so the validator reports a type
/// error against the field instead of the conversion silently dropping it.
/// Empty cells return `None` and surface as missing fields.
pub fn cell_to_value(spec: &FieldSpec, cell: &str) -> Option<Value> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    match spec.kind {
        FieldKind::Integer { .. } => Some(
            cell.parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(cell.to_string())),
        ),
        FieldKind::Categorical { .. } => Some(Value::String(cell.to_string())),
    }
}

/// Example record used in the OpenAPI document and in tests.
pub fn example_record() -> Value {
    json!({
        "age": 35,
        "job": "management",
        "marital": "married",
        "education": "university.degree",
        "default": "no",
        "balance": 1200,
        "housing": "yes",
        "loan": "no",
        "contact": "cellular",
        "day": 5,
        "month": "may",
        "duration": 120,
        "campaign": 2,
        "pdays": 999,
        "previous": 0,
        "poutcome": "nonexistent"
    })
}

/// Build the OpenAPI document describing the service inputs.
pub fn openapi_document() -> Value {
    let mut properties = Map::new();
    let mut components = Map::new();

    for (order, spec) in FIELDS.iter().enumerate() {
        let property = match spec.kind {
            FieldKind::Integer { minimum, maximum } => {
                let mut p = json!({
                    "type": "integer",
                    "title": title_case(spec.name),
                    "description": spec.description,
                    "x-order": order,
                });
                if let Some(min) = minimum {
                    p["minimum"] = json!(min);
                }
                if let Some(max) = maximum {
                    p["maximum"] = json!(max);
                }
                p
            }
            FieldKind::Categorical { component, choices } => {
                components
                    .entry(component.to_string())
                    .or_insert_with(|| {
                        json!({
                            "title": component,
                            "description": "An enumeration.",
                            "enum": choices,
                            "type": "string",
                        })
                    });
                json!({
                    "allOf": [{ "$ref": format!("#/components/schemas/{component}") }],
                    "description": spec.description,
                    "x-order": order,
                })
            }
        };
        properties.insert(spec.name.to_string(), property);
    }

    let required: Vec<&str> = FIELDS.iter().map(|f| f.name).collect();
    components.insert(
        RECORD_SCHEMA_KEY.to_string(),
        json!({
            "title": RECORD_SCHEMA_KEY,
            "type": "object",
            "properties": properties,
            "required": required,
            "example": example_record(),
        }),
    );
    components.insert(
        "PredictionResult".to_string(),
        json!({
            "title": "PredictionResult",
            "type": "object",
            "properties": {
                "label": { "type": "integer", "enum": [0, 1] },
                "probability": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
            },
            "required": ["label", "probability"]
        }),
    );

    json!({
        "openapi": "3.0.2",
        "info": {
            "title": "Term Deposit Prediction API",
            "version": crate::version::PREDSERVE_VERSION,
        },
        "paths": {
            "/predict/single": {
                "post": {
                    "summary": "Predict for a single client",
                    "requestBody": {
                        "required": true,
                        "content": { "application/json": { "schema": { "$ref": format!("#/components/schemas/{RECORD_SCHEMA_KEY}") } } }
                    },
                    "responses": {
                        "200": { "content": { "application/json": { "schema": { "$ref": "#/components/schemas/PredictionResult" } } } }
                    }
                }
            }
        },
        "components": { "schemas": components },
    })
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
