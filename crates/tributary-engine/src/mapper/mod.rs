//! Schema mapper
//!
//! A [`DataMapping`] is compiled once per run against its registered [`TargetSchema`];
//! compilation is where configuration mistakes surface (unknown fields, required
//! fields with neither a mapping nor a default, unknown custom functions, bad
//! patterns). The compiled mapping then turns each raw record into a
//! [`MappedRecord`] keyed by its logical identifier. Mapping is pure: the same raw
//! record always yields the same mapped record.

pub mod functions;
pub mod schema;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::adapter::json_path;
use crate::error::{ErrorKind, Severity, SyncError};
use crate::models::{
    AggregateFn, DataMapping, FieldMapping, FieldType, MappedRecord, RawRecord, TargetField,
    TargetSchema, Transformation, ValueOp,
};

pub use functions::{CustomFn, FunctionRegistry};
use schema::{coerce, parse_timestamp, parse_timestamp_with, timestamp_value};

/// Configuration errors found while compiling a mapping
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("mapping targets entity '{mapping}' but schema '{schema}' was supplied")]
    EntityMismatch { mapping: String, schema: String },

    #[error("target field '{field}' is not part of entity '{entity}'")]
    UnknownTargetField { entity: String, field: String },

    #[error("target field '{0}' is mapped more than once")]
    DuplicateTarget(String),

    #[error("required field '{0}' has neither a source mapping nor a default value")]
    MissingRequired(String),

    #[error("mapping declares no key fields")]
    NoKeyFields,

    #[error("key field '{0}' is not mapped from the source")]
    UnmappedKeyField(String),

    #[error("unknown custom function '{0}'")]
    UnknownFunction(String),

    #[error("invalid pattern for '{field}': {message}")]
    InvalidPattern { field: String, message: String },

    #[error("invalid validation rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
}

/// Why a single record could not be mapped
#[derive(Debug, Clone, PartialEq)]
pub struct RecordError {
    pub field: Option<String>,
    pub message: String,
}

impl RecordError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn to_sync_error(&self, record_id: Option<&str>) -> SyncError {
        let mut error = SyncError::new(ErrorKind::SchemaValidationError, Severity::Error, &self.message);
        if let Some(field) = &self.field {
            error = error.with_field(field);
        }
        if let Some(id) = record_id {
            error = error.with_record(id);
        }
        error
    }
}

enum CompiledOp {
    Uppercase,
    Lowercase,
    Trim,
    Prefix(String),
    Suffix(String),
    Replace(Regex, String),
    Truncate(usize),
    Scale(f64),
    Round(u32),
}

enum CompiledTransform {
    Copy,
    Convert {
        to: FieldType,
        format: Option<String>,
    },
    Value(CompiledOp),
    Aggregate {
        function: AggregateFn,
        sources: Vec<String>,
        separator: String,
    },
    Lookup {
        table: BTreeMap<String, Value>,
        fallback: Option<Value>,
    },
    Custom {
        function: CustomFn,
        args: Vec<Value>,
    },
}

struct CompiledStep {
    source_path: String,
    target: TargetField,
    transform: CompiledTransform,
    default_value: Option<Value>,
}

/// A mapping validated against its schema and ready to apply
pub struct CompiledMapping {
    entity: String,
    steps: Vec<CompiledStep>,
    /// Unmapped schema fields that carry a default
    fills: Vec<TargetField>,
    key_fields: Vec<String>,
    timestamp_path: Option<String>,
    deleted_path: Option<String>,
}

fn compile_transform(
    mapping: &FieldMapping,
    functions: &FunctionRegistry,
) -> Result<CompiledTransform, MappingError> {
    let transform = match &mapping.transformation {
        None | Some(Transformation::FieldMapping) => CompiledTransform::Copy,
        Some(Transformation::DataTypeConversion { to, format }) => CompiledTransform::Convert {
            to: *to,
            format: format.clone(),
        },
        Some(Transformation::ValueTransformation { operation }) => {
            CompiledTransform::Value(match operation {
                ValueOp::Uppercase => CompiledOp::Uppercase,
                ValueOp::Lowercase => CompiledOp::Lowercase,
                ValueOp::Trim => CompiledOp::Trim,
                ValueOp::Prefix { value } => CompiledOp::Prefix(value.clone()),
                ValueOp::Suffix { value } => CompiledOp::Suffix(value.clone()),
                ValueOp::Replace {
                    pattern,
                    replacement,
                } => CompiledOp::Replace(
                    Regex::new(pattern).map_err(|e| MappingError::InvalidPattern {
                        field: mapping.target_field.clone(),
                        message: e.to_string(),
                    })?,
                    replacement.clone(),
                ),
                ValueOp::Truncate { max_len } => CompiledOp::Truncate(*max_len),
                ValueOp::Scale { factor } => CompiledOp::Scale(*factor),
                ValueOp::Round { digits } => CompiledOp::Round(*digits),
            })
        }
        Some(Transformation::Aggregation {
            function,
            sources,
            separator,
        }) => CompiledTransform::Aggregate {
            function: *function,
            sources: sources.clone(),
            separator: separator.clone().unwrap_or_else(|| " ".to_string()),
        },
        Some(Transformation::Lookup { table, fallback }) => CompiledTransform::Lookup {
            table: table.clone(),
            fallback: fallback.clone(),
        },
        Some(Transformation::CustomFunction { name, args }) => CompiledTransform::Custom {
            function: functions
                .get(name)
                .ok_or_else(|| MappingError::UnknownFunction(name.clone()))?,
            args: args.clone(),
        },
    };
    Ok(transform)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

fn number_of(value: &Value) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("expected a number, found {value}"))
}

fn apply_op(op: &CompiledOp, value: Value) -> Result<Value, String> {
    let text = || text_of(&value).ok_or_else(|| format!("expected a scalar, found {value}"));
    let out = match op {
        CompiledOp::Uppercase => Value::String(text()?.to_uppercase()),
        CompiledOp::Lowercase => Value::String(text()?.to_lowercase()),
        CompiledOp::Trim => Value::String(text()?.trim().to_string()),
        CompiledOp::Prefix(prefix) => Value::String(format!("{prefix}{}", text()?)),
        CompiledOp::Suffix(suffix) => Value::String(format!("{}{suffix}", text()?)),
        CompiledOp::Replace(regex, replacement) => {
            Value::String(regex.replace_all(&text()?, replacement.as_str()).into_owned())
        }
        CompiledOp::Truncate(max_len) => Value::String(text()?.chars().take(*max_len).collect()),
        CompiledOp::Scale(factor) => Value::from(number_of(&value)? * factor),
        CompiledOp::Round(digits) => {
            let scale = 10f64.powi(*digits as i32);
            Value::from((number_of(&value)? * scale).round() / scale)
        }
    };
    Ok(out)
}

fn aggregate(function: AggregateFn, separator: &str, value: Value) -> Result<Value, String> {
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let numbers = || items.iter().map(number_of).collect::<Result<Vec<_>, _>>();
    let out = match function {
        AggregateFn::Count => Value::from(items.len() as u64),
        AggregateFn::First => items.first().cloned().unwrap_or(Value::Null),
        AggregateFn::Last => items.last().cloned().unwrap_or(Value::Null),
        AggregateFn::Concat => Value::String(
            items
                .iter()
                .filter_map(text_of)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        AggregateFn::Sum => {
            // integers stay exact until they overflow
            let exact = items
                .iter()
                .try_fold(0i64, |total, item| item.as_i64().and_then(|n| total.checked_add(n)));
            match exact {
                Some(total) => Value::from(total),
                None => Value::from(numbers()?.iter().sum::<f64>()),
            }
        }
        AggregateFn::Avg => {
            let values = numbers()?;
            if values.is_empty() {
                Value::Null
            } else {
                Value::from(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggregateFn::Min => numbers()?
            .into_iter()
            .reduce(f64::min)
            .map(Value::from)
            .unwrap_or(Value::Null),
        AggregateFn::Max => numbers()?
            .into_iter()
            .reduce(f64::max)
            .map(Value::from)
            .unwrap_or(Value::Null),
    };
    Ok(out)
}

fn apply(transform: &CompiledTransform, value: Value) -> Result<Value, String> {
    match transform {
        CompiledTransform::Copy => Ok(value),
        CompiledTransform::Convert {
            to: FieldType::Timestamp,
            format: Some(format),
        } => parse_timestamp_with(&value, format)
            .map(timestamp_value)
            .ok_or_else(|| format!("'{value}' does not match timestamp format '{format}'")),
        CompiledTransform::Convert { to, .. } => coerce(value, *to),
        CompiledTransform::Value(op) => apply_op(op, value),
        CompiledTransform::Aggregate {
            function,
            separator,
            ..
        } => aggregate(*function, separator, value),
        CompiledTransform::Lookup { table, fallback } => text_of(&value)
            .and_then(|key| table.get(&key).cloned())
            .or_else(|| fallback.clone())
            .ok_or_else(|| format!("no lookup entry for {value}")),
        CompiledTransform::Custom { function, args } => function(&value, args),
    }
}

fn key_part(value: &Value) -> String {
    text_of(value).unwrap_or_else(|| value.to_string())
}

/// Logical record identifier: `"{entity}:{v1}|{v2}…"`
pub fn logical_key(entity: &str, parts: &[String]) -> String {
    format!("{entity}:{}", parts.join("|"))
}

impl CompiledMapping {
    pub fn compile(
        mapping: &DataMapping,
        schema: &TargetSchema,
        functions: &FunctionRegistry,
    ) -> Result<Self, MappingError> {
        if mapping.target_entity != schema.entity {
            return Err(MappingError::EntityMismatch {
                mapping: mapping.target_entity.clone(),
                schema: schema.entity.clone(),
            });
        }

        let mut mapped = BTreeSet::new();
        let mut steps = Vec::with_capacity(mapping.field_mappings.len());
        for field_mapping in &mapping.field_mappings {
            let target = schema.field(&field_mapping.target_field).ok_or_else(|| {
                MappingError::UnknownTargetField {
                    entity: schema.entity.clone(),
                    field: field_mapping.target_field.clone(),
                }
            })?;
            if !mapped.insert(target.name.clone()) {
                return Err(MappingError::DuplicateTarget(target.name.clone()));
            }
            steps.push(CompiledStep {
                source_path: field_mapping.source_field.clone(),
                target: target.clone(),
                transform: compile_transform(field_mapping, functions)?,
                default_value: field_mapping.default_value.clone(),
            });
        }

        let mut fills = Vec::new();
        for field in &schema.fields {
            if mapped.contains(&field.name) {
                continue;
            }
            match (&field.default_value, field.required) {
                (Some(_), _) => fills.push(field.clone()),
                (None, true) => return Err(MappingError::MissingRequired(field.name.clone())),
                (None, false) => {}
            }
        }

        if mapping.key_fields.is_empty() {
            return Err(MappingError::NoKeyFields);
        }
        if let Some(key) = mapping.key_fields.iter().find(|k| !mapped.contains(*k)) {
            return Err(MappingError::UnmappedKeyField(key.clone()));
        }

        Ok(Self {
            entity: schema.entity.clone(),
            steps,
            fills,
            key_fields: mapping.key_fields.clone(),
            timestamp_path: mapping.timestamp_field.clone(),
            deleted_path: mapping.deleted_field.clone(),
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    fn read_input(&self, step: &CompiledStep, data: &Value) -> Option<Value> {
        if let CompiledTransform::Aggregate { sources, .. } = &step.transform {
            if !sources.is_empty() {
                return Some(Value::Array(
                    sources
                        .iter()
                        .filter_map(|path| json_path(data, path))
                        .filter(|v| !v.is_null())
                        .cloned()
                        .collect(),
                ));
            }
        }
        json_path(data, &step.source_path)
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn map_step(&self, step: &CompiledStep, data: &Value) -> Result<Option<Value>, RecordError> {
        let name = step.target.name.as_str();
        let transformed = match self.read_input(step, data) {
            Some(input) => Some(apply(&step.transform, input).map_err(|m| RecordError::field(name, m))?),
            None => match &step.transform {
                CompiledTransform::Custom { .. } => {
                    Some(apply(&step.transform, Value::Null).map_err(|m| RecordError::field(name, m))?)
                }
                _ => None,
            },
        };

        let value = transformed
            .filter(|v| !v.is_null())
            .or_else(|| step.default_value.clone())
            .or_else(|| step.target.default_value.clone());

        match value {
            Some(v) => coerce(v, step.target.field_type)
                .map(Some)
                .map_err(|m| RecordError::field(name, m)),
            None if step.target.required => Err(RecordError::field(
                name,
                format!("required field '{name}' is missing from the source record"),
            )),
            None => Ok(None),
        }
    }

    /// Map one raw record
    ///
    /// Tombstones only need their key fields; other field errors are ignored for them.
    pub fn map_record(
        &self,
        raw: &RawRecord,
        default_confidence: f64,
        fetched_at: DateTime<Utc>,
    ) -> Result<MappedRecord, RecordError> {
        let deleted = raw.deleted
            || self
                .deleted_path
                .as_deref()
                .and_then(|path| json_path(&raw.data, path))
                .is_some_and(truthy);

        let mut fields = BTreeMap::new();
        for step in &self.steps {
            match self.map_step(step, &raw.data) {
                Ok(Some(value)) => {
                    fields.insert(step.target.name.clone(), value);
                }
                Ok(None) => {}
                Err(_) if deleted && !self.key_fields.contains(&step.target.name) => {}
                Err(e) => return Err(e),
            }
        }

        for field in &self.fills {
            if let Some(default) = &field.default_value {
                let value = coerce(default.clone(), field.field_type)
                    .map_err(|m| RecordError::field(&field.name, m))?;
                fields.insert(field.name.clone(), value);
            }
        }

        let mut parts = Vec::with_capacity(self.key_fields.len());
        for key in &self.key_fields {
            match fields.get(key) {
                Some(value) if !value.is_null() => parts.push(key_part(value)),
                _ => {
                    return Err(RecordError::field(
                        key,
                        format!("key field '{key}' is missing; the record has no logical identifier"),
                    ))
                }
            }
        }

        let timestamp = self
            .timestamp_path
            .as_deref()
            .and_then(|path| json_path(&raw.data, path))
            .and_then(parse_timestamp)
            .or(raw.timestamp)
            .unwrap_or(fetched_at);

        Ok(MappedRecord {
            logical_key: logical_key(&self.entity, &parts),
            entity: self.entity.clone(),
            fields,
            timestamp,
            confidence: raw.confidence.unwrap_or(default_confidence).clamp(0.0, 1.0),
            deleted,
        })
    }

    /// Best-effort identifier of a raw record for error reports
    pub fn describe(&self, raw: &RawRecord) -> Option<String> {
        let parts = self
            .steps
            .iter()
            .filter(|s| self.key_fields.contains(&s.target.name))
            .map(|s| json_path(&raw.data, &s.source_path).map(key_part))
            .collect::<Option<Vec<_>>>()?;
        Some(logical_key(&self.entity, &parts))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TargetSchema {
        serde_json::from_value(json!({
            "entity": "article",
            "fields": [
                {"name": "external_id", "field_type": "string", "required": true},
                {"name": "title", "field_type": "string", "required": true},
                {"name": "slug", "field_type": "string"},
                {"name": "word_count", "field_type": "integer"},
                {"name": "section", "field_type": "string"},
                {"name": "published_at", "field_type": "timestamp"},
                {"name": "language", "field_type": "string", "required": true, "default_value": "en"}
            ]
        }))
        .unwrap()
    }

    fn mapping() -> DataMapping {
        serde_json::from_value(json!({
            "target_entity": "article",
            "key_fields": ["external_id"],
            "timestamp_field": "updated",
            "deleted_field": "removed",
            "field_mappings": [
                {"source_field": "id", "target_field": "external_id"},
                {"source_field": "headline", "target_field": "title",
                 "transformation": {"type": "value_transformation", "operation": {"kind": "trim"}}},
                {"source_field": "headline", "target_field": "slug",
                 "transformation": {"type": "custom_function", "name": "slugify"}},
                {"source_field": "words", "target_field": "word_count",
                 "transformation": {"type": "data_type_conversion", "to": "integer"}},
                {"source_field": "desk", "target_field": "section",
                 "transformation": {"type": "lookup", "table": {"pol": "Politics"}, "fallback": "General"}},
                {"source_field": "published", "target_field": "published_at"}
            ]
        }))
        .unwrap()
    }

    fn compiled() -> CompiledMapping {
        CompiledMapping::compile(&mapping(), &schema(), &FunctionRegistry::builtin()).unwrap()
    }

    #[test]
    fn test_maps_record() {
        let raw = RawRecord::new(json!({
            "id": 42,
            "headline": "  Budget Vote Passes ",
            "words": "812",
            "desk": "pol",
            "published": 1_700_000_000,
            "updated": "2026-01-02T03:04:05Z"
        }));
        let record = compiled().map_record(&raw, 0.5, Utc::now()).unwrap();

        assert_eq!(record.logical_key, "article:42");
        assert_eq!(record.fields["title"], json!("Budget Vote Passes"));
        assert_eq!(record.fields["slug"], json!("budget-vote-passes"));
        assert_eq!(record.fields["word_count"], json!(812));
        assert_eq!(record.fields["section"], json!("Politics"));
        assert_eq!(record.fields["language"], json!("en"));
        assert_eq!(record.timestamp.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(!record.deleted);
    }

    #[test]
    fn test_missing_required_field_rejects_record() {
        let raw = RawRecord::new(json!({"id": 1}));
        let err = compiled().map_record(&raw, 0.5, Utc::now()).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("title"));
    }

    #[test]
    fn test_tombstone_needs_only_key() {
        let raw = RawRecord::new(json!({"id": 7, "removed": true}));
        let record = compiled().map_record(&raw, 0.5, Utc::now()).unwrap();
        assert!(record.deleted);
        assert_eq!(record.logical_key, "article:7");
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let raw = RawRecord::new(json!({"id": "a", "headline": "Hi", "updated": "2026-01-01T00:00:00Z"}));
        let mapper = compiled();
        let fetched = Utc::now();
        assert_eq!(
            mapper.map_record(&raw, 0.5, fetched).unwrap(),
            mapper.map_record(&raw, 0.5, fetched).unwrap()
        );
    }

    #[test]
    fn test_required_field_without_mapping_or_default_fails_compile() {
        let mut mapping = mapping();
        mapping.field_mappings.retain(|m| m.target_field != "title");
        let err = CompiledMapping::compile(&mapping, &schema(), &FunctionRegistry::builtin()).err();
        assert_eq!(err, Some(MappingError::MissingRequired("title".to_string())));
    }

    #[test]
    fn test_unknown_function_fails_compile() {
        let mut mapping = mapping();
        mapping.field_mappings[2].transformation = Some(Transformation::CustomFunction {
            name: "rot13".to_string(),
            args: vec![],
        });
        let err = CompiledMapping::compile(&mapping, &schema(), &FunctionRegistry::builtin()).err();
        assert_eq!(err, Some(MappingError::UnknownFunction("rot13".to_string())));
    }

    #[test]
    fn test_unknown_target_and_missing_keys_fail_compile() {
        let mut unknown = mapping();
        unknown.field_mappings[0].target_field = "nope".to_string();
        assert!(matches!(
            CompiledMapping::compile(&unknown, &schema(), &FunctionRegistry::builtin()),
            Err(MappingError::UnknownTargetField { .. })
        ));

        let mut keyless = mapping();
        keyless.key_fields.clear();
        assert!(matches!(
            CompiledMapping::compile(&keyless, &schema(), &FunctionRegistry::builtin()),
            Err(MappingError::NoKeyFields)
        ));
    }

    #[test]
    fn test_aggregation_over_sources() {
        let value = aggregate(AggregateFn::Sum, " ", json!([1, 2, 3])).unwrap();
        assert_eq!(value, json!(6));
        let avg = aggregate(AggregateFn::Avg, " ", json!([1, 2])).unwrap();
        assert_eq!(avg, json!(1.5));
        let joined = aggregate(AggregateFn::Concat, ", ", json!(["a", "b"])).unwrap();
        assert_eq!(joined, json!("a, b"));
        assert!(aggregate(AggregateFn::Max, " ", json!(["x"])).is_err());
    }

    #[test]
    fn test_sum_past_integer_range_falls_back_to_float() {
        let value = aggregate(AggregateFn::Sum, " ", json!([i64::MAX, 1])).unwrap();
        assert_eq!(value, json!(i64::MAX as f64 + 1.0));
        let value = aggregate(AggregateFn::Sum, " ", json!([i64::MIN, -1, 2.5])).unwrap();
        assert_eq!(value, json!(i64::MIN as f64 + 1.5));
        let value = aggregate(AggregateFn::Sum, " ", json!([i64::MAX, -1])).unwrap();
        assert_eq!(value, json!(i64::MAX - 1));
    }

    #[test]
    fn test_value_ops() {
        let replace = CompiledOp::Replace(Regex::new(r"\s+").unwrap(), "_".to_string());
        assert_eq!(apply_op(&replace, json!("a  b c")).unwrap(), json!("a_b_c"));
        assert_eq!(apply_op(&CompiledOp::Round(1), json!(2.46)).unwrap(), json!(2.5));
        assert_eq!(apply_op(&CompiledOp::Truncate(3), json!("abcdef")).unwrap(), json!("abc"));
        assert!(apply_op(&CompiledOp::Scale(2.0), json!("x")).is_err());
    }

    #[test]
    fn test_describe_raw_record() {
        let raw = RawRecord::new(json!({"id": 9}));
        assert_eq!(compiled().describe(&raw).as_deref(), Some("article:9"));
        assert_eq!(compiled().describe(&RawRecord::new(json!({}))), None);
    }
}
