//! Named pure functions for `custom_function` transformations

use serde_json::Value;
use std::collections::HashMap;
use tributary_common::fingerprint::fingerprint_bytes;

/// A custom transformation: `(input, args) -> output`
pub type CustomFn = fn(&Value, &[Value]) -> Result<Value, String>;

/// Registry of custom functions available to mappings
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, CustomFn>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FunctionRegistry {
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registry holding `slugify`, `sha256`, `coalesce` and `split_part`
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("slugify", slugify);
        registry.register("sha256", sha256);
        registry.register("coalesce", coalesce);
        registry.register("split_part", split_part);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, function: CustomFn) {
        self.functions.insert(name.into(), function);
    }

    pub fn get(&self, name: &str) -> Option<CustomFn> {
        self.functions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn slugify(input: &Value, _args: &[Value]) -> Result<Value, String> {
    let text = as_text(input).ok_or("slugify expects a scalar")?;
    let mut slug = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    Ok(Value::String(slug.trim_end_matches('-').to_string()))
}

fn sha256(input: &Value, _args: &[Value]) -> Result<Value, String> {
    let text = match input {
        Value::Null => return Ok(Value::Null),
        other => as_text(other).unwrap_or_else(|| other.to_string()),
    };
    Ok(Value::String(fingerprint_bytes(text.as_bytes())))
}

fn coalesce(input: &Value, args: &[Value]) -> Result<Value, String> {
    Ok(std::iter::once(input)
        .chain(args.iter())
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

/// `split_part(input, separator, index)`; index is zero based
fn split_part(input: &Value, args: &[Value]) -> Result<Value, String> {
    let text = as_text(input).ok_or("split_part expects a scalar")?;
    let separator = args
        .first()
        .and_then(Value::as_str)
        .ok_or("split_part needs a separator argument")?;
    let index = args
        .get(1)
        .and_then(Value::as_u64)
        .ok_or("split_part needs an index argument")? as usize;

    Ok(text
        .split(separator)
        .nth(index)
        .map(|part| Value::String(part.to_string()))
        .unwrap_or(Value::Null))
}
