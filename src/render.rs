//! Step-input rendering.
//!
//! Template fields reference accumulated job-run lookup data with
//! `{{ .path.to.value }}` expressions. A field that is exactly one
//! placeholder resolves to the referenced JSON value with its type
//! preserved; placeholders embedded in a longer string interpolate as text.
//! Nested maps render recursively; any other nested container is a
//! data-shape error.

use serde_json::{Map, Value};

use crate::error::RenderError;

/// Render every template field against `context`.
pub fn render_template_fields(
    context: &Map<String, Value>,
    fields: &Map<String, Value>,
) -> Result<Map<String, Value>, RenderError> {
    let mut rendered = Map::with_capacity(fields.len());
    for (name, value) in fields {
        rendered.insert(name.clone(), render_value(context, name, value)?);
    }
    Ok(rendered)
}

fn render_value(
    context: &Map<String, Value>,
    field: &str,
    value: &Value,
) -> Result<Value, RenderError> {
    match value {
        Value::String(template) => render_string(context, field, template),
        Value::Object(nested) => {
            let mut rendered = Map::with_capacity(nested.len());
            for (name, value) in nested {
                rendered.insert(name.clone(), render_value(context, name, value)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(_) => Err(RenderError::DataShape {
            field: field.to_string(),
            detail: "nested values must be maps or scalars".to_string(),
        }),
        other => Ok(other.clone()),
    }
}

fn render_string(
    context: &Map<String, Value>,
    field: &str,
    template: &str,
) -> Result<Value, RenderError> {
    // A field that is exactly one placeholder keeps the referenced value's
    // JSON type instead of stringifying it.
    if let Some(path) = sole_placeholder(template) {
        return lookup(context, field, path).cloned();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| RenderError::Malformed {
                field: field.to_string(),
                detail: "unterminated placeholder".to_string(),
            })?;
        let expr = after_open[..close].trim();
        let path = expr.strip_prefix('.').ok_or_else(|| RenderError::Malformed {
            field: field.to_string(),
            detail: format!("expression {expr:?} must start with '.'"),
        })?;
        let value = lookup(context, field, path)?;
        match value {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Returns the dotted path when the whole template is one placeholder.
fn sole_placeholder(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    let expr = inner.trim();
    // A second delimiter means this is interpolation, not a single reference.
    if expr.contains("{{") || expr.contains("}}") {
        return None;
    }
    expr.strip_prefix('.')
}

fn lookup<'a>(
    context: &'a Map<String, Value>,
    field: &str,
    path: &str,
) -> Result<&'a Value, RenderError> {
    let mut segments = path.split('.');
    let first = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| {
        RenderError::Malformed {
            field: field.to_string(),
            detail: "empty reference path".to_string(),
        }
    })?;
    let mut current = context.get(first).ok_or_else(|| RenderError::MissingPath {
        path: path.to_string(),
    })?;
    for segment in segments {
        current = current
            .as_object()
            .and_then(|map| map.get(segment))
            .ok_or_else(|| RenderError::MissingPath {
                path: path.to_string(),
            })?;
    }
    Ok(current)
}
