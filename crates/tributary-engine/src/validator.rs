//! Record validation and data quality accounting
//!
//! Every mapped record is checked against its target schema (required fields and
//! types) and against the business rules declared on the mapping. Violations at
//! `error` severity or above exclude the record from the run; lower severities are
//! recorded as warnings and the record proceeds.

use regex::Regex;
use serde_json::Value;

use crate::error::{ErrorKind, Severity, SyncError};
use crate::mapper::schema::conforms;
use crate::mapper::MappingError;
use crate::models::{DataMapping, DataQualityReport, MappedRecord, RuleCheck, TargetSchema};

enum Check {
    Required,
    NotEmpty,
    Pattern(Regex),
    Range { min: Option<f64>, max: Option<f64> },
    Length { min: Option<usize>, max: Option<usize> },
    OneOf(Vec<Value>),
}

struct CompiledRule {
    name: String,
    field: String,
    check: Check,
    severity: Severity,
    message: Option<String>,
}

/// A failed check
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub rule: String,
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    pub fn to_sync_error(&self, record_id: &str) -> SyncError {
        SyncError::new(ErrorKind::SchemaValidationError, self.severity, &self.message)
            .with_field(&self.field)
            .with_record(record_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub violations: Vec<Violation>,
}

impl ValidationOutcome {
    /// No violation at `error` severity or above
    pub fn passed(&self) -> bool {
        self.violations.iter().all(|v| v.severity < Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity < Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity >= Severity::Error)
    }
}

pub struct Validator {
    schema: TargetSchema,
    rules: Vec<CompiledRule>,
}

fn compile_check(rule_name: &str, check: &RuleCheck) -> Result<Check, MappingError> {
    Ok(match check {
        RuleCheck::Required => Check::Required,
        RuleCheck::NotEmpty => Check::NotEmpty,
        RuleCheck::Pattern { regex } => {
            Check::Pattern(Regex::new(regex).map_err(|e| MappingError::InvalidRule {
                rule: rule_name.to_string(),
                message: e.to_string(),
            })?)
        }
        RuleCheck::Range { min, max } => Check::Range {
            min: *min,
            max: *max,
        },
        RuleCheck::Length { min, max } => Check::Length {
            min: *min,
            max: *max,
        },
        RuleCheck::OneOf { values } => Check::OneOf(values.clone()),
    })
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

impl Check {
    /// `None` when the check passes, otherwise the default failure message
    fn evaluate(&self, field: &str, value: Option<&Value>) -> Option<String> {
        let value = value.filter(|v| !v.is_null());
        match (self, value) {
            (Check::Required, None) => Some(format!("'{field}' is required")),
            (Check::NotEmpty, v) if v.is_none_or(is_empty) => Some(format!("'{field}' must not be empty")),
            // The remaining checks only constrain values that are present.
            (_, None) => None,
            (Check::Pattern(regex), Some(v)) => {
                let matched = match v {
                    Value::String(s) => regex.is_match(s),
                    other => regex.is_match(&other.to_string()),
                };
                (!matched).then(|| format!("'{field}' does not match {}", regex.as_str()))
            }
            (Check::Range { min, max }, Some(v)) => match v.as_f64() {
                Some(n) if min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m) => None,
                Some(n) => Some(format!("'{field}' value {n} is out of range")),
                None => Some(format!("'{field}' is not numeric")),
            },
            (Check::Length { min, max }, Some(v)) => {
                let len = match v {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    _ => return Some(format!("'{field}' has no length")),
                };
                (min.is_some_and(|m| len < m) || max.is_some_and(|m| len > m))
                    .then(|| format!("'{field}' length {len} is out of bounds"))
            }
            (Check::OneOf(values), Some(v)) => {
                (!values.contains(v)).then(|| format!("'{field}' value {v} is not allowed"))
            }
            _ => None,
        }
    }
}

impl Validator {
    pub fn compile(mapping: &DataMapping, schema: &TargetSchema) -> Result<Self, MappingError> {
        let mut rules = Vec::new();

        let field_rules = mapping.field_mappings.iter().flat_map(|fm| {
            fm.validation_rules
                .iter()
                .map(move |rule| (rule, rule.field.clone().unwrap_or_else(|| fm.target_field.clone())))
        });
        let record_rules = mapping
            .validation_rules
            .iter()
            .map(|rule| (rule, rule.field.clone().unwrap_or_default()));

        for (rule, field) in field_rules.chain(record_rules) {
            if field.is_empty() {
                return Err(MappingError::InvalidRule {
                    rule: rule.name.clone(),
                    message: "record level rules must name a field".to_string(),
                });
            }
            if schema.field(&field).is_none() {
                return Err(MappingError::UnknownTargetField {
                    entity: schema.entity.clone(),
                    field,
                });
            }
            rules.push(CompiledRule {
                name: rule.name.clone(),
                check: compile_check(&rule.name, &rule.check)?,
                field,
                severity: rule.severity,
                message: rule.message.clone(),
            });
        }

        Ok(Self {
            schema: schema.clone(),
            rules,
        })
    }

    /// Tombstones are not validated; they only carry a key.
    pub fn validate(&self, record: &MappedRecord) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        if record.deleted {
            return outcome;
        }

        for field in &self.schema.fields {
            match record.fields.get(&field.name).filter(|v| !v.is_null()) {
                None if field.required => outcome.violations.push(Violation {
                    rule: "schema.required".to_string(),
                    field: field.name.clone(),
                    severity: Severity::Error,
                    message: format!("'{}' is required by the schema", field.name),
                }),
                Some(value) if !conforms(value, field.field_type) => outcome.violations.push(Violation {
                    rule: "schema.type".to_string(),
                    field: field.name.clone(),
                    severity: Severity::Error,
                    message: format!("'{}' is not a {}", field.name, field.field_type.as_str()),
                }),
                _ => {}
            }
        }

        for rule in &self.rules {
            if let Some(default_message) = rule.check.evaluate(&rule.field, record.fields.get(&rule.field)) {
                outcome.violations.push(Violation {
                    rule: rule.name.clone(),
                    field: rule.field.clone(),
                    severity: rule.severity,
                    message: rule.message.clone().unwrap_or(default_message),
                });
            }
        }

        outcome
    }
}

/// Accumulates the numbers behind a run's [`DataQualityReport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityTracker {
    total: u64,
    valid: u64,
    invalid: u64,
    duplicates: u64,
    warnings: u64,
}

impl QualityTracker {
    pub fn record_valid(&mut self, warnings: usize) {
        self.total += 1;
        self.valid += 1;
        self.warnings += warnings as u64;
    }

    pub fn record_invalid(&mut self) {
        self.total += 1;
        self.invalid += 1;
    }

    pub fn record_duplicates(&mut self, n: u64) {
        self.duplicates += n;
    }

    pub fn merge(&mut self, other: &QualityTracker) {
        self.total += other.total;
        self.valid += other.valid;
        self.invalid += other.invalid;
        self.duplicates += other.duplicates;
        self.warnings += other.warnings;
    }

    pub fn report(&self) -> DataQualityReport {
        DataQualityReport::compute(self.total, self.valid, self.invalid, self.duplicates, self.warnings)
    }
}
