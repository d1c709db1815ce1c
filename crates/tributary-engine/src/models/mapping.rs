//! Canonical schemas and field mappings

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Severity;

/// Type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetField {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// Canonical target shape for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSchema {
    pub entity: String,
    pub fields: Vec<TargetField>,
}

impl TargetSchema {
    pub fn field(&self, name: &str) -> Option<&TargetField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Named string/number operations for `value_transformation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueOp {
    Uppercase,
    Lowercase,
    Trim,
    Prefix { value: String },
    Suffix { value: String },
    Replace { pattern: String, replacement: String },
    Truncate { max_len: usize },
    Scale { factor: f64 },
    Round { digits: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Concat,
    First,
    Last,
}

/// Transformation applied between the source field and the target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    /// Direct copy
    FieldMapping,
    DataTypeConversion {
        to: FieldType,
        /// strftime pattern for string to timestamp conversion
        #[serde(default)]
        format: Option<String>,
    },
    ValueTransformation {
        operation: ValueOp,
    },
    /// Combines several source paths (or the elements of an array source field)
    Aggregation {
        function: AggregateFn,
        #[serde(default)]
        sources: Vec<String>,
        #[serde(default)]
        separator: Option<String>,
    },
    Lookup {
        table: BTreeMap<String, Value>,
        #[serde(default)]
        fallback: Option<Value>,
    },
    CustomFunction {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl Transformation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transformation::FieldMapping => "field_mapping",
            Transformation::DataTypeConversion { .. } => "data_type_conversion",
            Transformation::ValueTransformation { .. } => "value_transformation",
            Transformation::Aggregation { .. } => "aggregation",
            Transformation::Lookup { .. } => "lookup",
            Transformation::CustomFunction { .. } => "custom_function",
        }
    }
}

/// Check performed by a validation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCheck {
    Required,
    NotEmpty,
    Pattern {
        regex: String,
    },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    OneOf {
        values: Vec<Value>,
    },
}

/// Business rule evaluated against a mapped record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    /// Target field the rule inspects; inherited from the owning field mapping when unset
    #[serde(default)]
    pub field: Option<String>,
    pub check: RuleCheck,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path into the raw record
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub transformation: Option<Transformation>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Used when the source value is missing or null
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// How raw provider records become canonical records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMapping {
    pub target_entity: String,
    pub field_mappings: Vec<FieldMapping>,
    /// Target fields forming the logical record identifier
    #[serde(default)]
    pub key_fields: Vec<String>,
    /// Source path holding the record's modification time
    #[serde(default)]
    pub timestamp_field: Option<String>,
    /// Source path holding a deletion flag
    #[serde(default)]
    pub deleted_field: Option<String>,
    /// Record level rules
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transformations_are_tagged() {
        let t: Transformation = serde_json::from_value(json!({
            "type": "value_transformation",
            "operation": {"kind": "prefix", "value": "urn:"}
        }))
        .unwrap();
        assert_eq!(t.as_str(), "value_transformation");

        let direct: Transformation = serde_json::from_value(json!({"type": "field_mapping"})).unwrap();
        assert_eq!(direct, Transformation::FieldMapping);
    }

    #[test]
    fn test_rule_severity_defaults_to_error() {
        let rule: ValidationRule = serde_json::from_value(json!({
            "name": "title-present",
            "check": {"kind": "not_empty"}
        }))
        .unwrap();
        assert_eq!(rule.severity, Severity::Error);
    }
}
