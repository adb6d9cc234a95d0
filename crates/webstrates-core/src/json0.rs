//! `json0` operation components.
//!
//! A `json0` operation is an ordered list of components. Each component
//! addresses a path from the document root and carries exactly one edit:
//!
//! | Fields | Edit |
//! |--------|------|
//! | `li` / `ld` / `ld`+`li` | list insert / delete / replace |
//! | `oi` / `od` / `od`+`oi` | object insert / delete / replace |
//! | `si` / `sd` | string insert / delete at a UTF-16 offset |
//! | `lm` | list move |
//! | `na` | number add |
//!
//! [`apply`] implements these edits. It never transforms concurrent
//! operations against each other; that is the sync server's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A `json0` operation.
pub type Op = Vec<Component>;

/// One step of a path: an array index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array index
    Index(usize),
    /// Object key
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Key(key) => write!(f, "{key}"),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

/// A single `json0` component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Component {
    /// Path from the document root
    pub p: Vec<PathSegment>,
    /// List item to insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub li: Option<Value>,
    /// List item to delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld: Option<Value>,
    /// Object value to insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    /// Object value to delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
    /// Text to insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si: Option<String>,
    /// Text to delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd: Option<String>,
    /// Target index of a list move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lm: Option<usize>,
    /// Number to add
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub na: Option<Value>,
}

impl Component {
    /// Insert (or overwrite) an object key, or replace the root when `p` is empty.
    #[must_use]
    pub fn object_insert(p: Vec<PathSegment>, value: Value) -> Self {
        Self {
            p,
            oi: Some(value),
            ..Self::default()
        }
    }

    /// Remove an object key.
    #[must_use]
    pub fn object_delete(p: Vec<PathSegment>, old: Value) -> Self {
        Self {
            p,
            od: Some(old),
            ..Self::default()
        }
    }

    /// Replace an object value, or the root when `p` is empty.
    #[must_use]
    pub fn object_replace(p: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self {
            p,
            od: Some(old),
            oi: Some(new),
            ..Self::default()
        }
    }

    /// Insert a list item before index `p.last()`.
    #[must_use]
    pub fn list_insert(p: Vec<PathSegment>, value: Value) -> Self {
        Self {
            p,
            li: Some(value),
            ..Self::default()
        }
    }

    /// Delete the list item at `p.last()`.
    #[must_use]
    pub fn list_delete(p: Vec<PathSegment>, old: Value) -> Self {
        Self {
            p,
            ld: Some(old),
            ..Self::default()
        }
    }

    /// Replace the list item at `p.last()`.
    #[must_use]
    pub fn list_replace(p: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self {
            p,
            ld: Some(old),
            li: Some(new),
            ..Self::default()
        }
    }

    /// Insert text into the string at `p[..len - 1]` at UTF-16 offset `p.last()`.
    #[must_use]
    pub fn string_insert(p: Vec<PathSegment>, text: impl Into<String>) -> Self {
        Self {
            p,
            si: Some(text.into()),
            ..Self::default()
        }
    }

    /// Delete text from the string at `p[..len - 1]` at UTF-16 offset `p.last()`.
    #[must_use]
    pub fn string_delete(p: Vec<PathSegment>, text: impl Into<String>) -> Self {
        Self {
            p,
            sd: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Apply an operation to a document in place.
///
/// Components are applied in order. On error the document may hold the
/// effects of the components before the failing one; callers that need
/// atomicity apply to a copy.
///
/// # Errors
///
/// Returns error if a path does not resolve, an index is out of bounds, a
/// target has the wrong type, or deleted text does not match.
pub fn apply(document: &mut Value, op: &[Component]) -> Result<(), ApplyError> {
    for component in op {
        apply_component(document, component)?;
    }
    Ok(())
}

fn apply_component(document: &mut Value, component: &Component) -> Result<(), ApplyError> {
    let Some((last, parent_path)) = component.p.split_last() else {
        return apply_at_root(document, component);
    };

    if component.si.is_some() || component.sd.is_some() {
        let PathSegment::Index(offset) = last else {
            return Err(ApplyError::invalid(component, "string offset must be an index"));
        };
        let target = resolve_mut(document, parent_path)?;
        let Value::String(text) = target else {
            return Err(ApplyError::TypeMismatch {
                path: format_path(parent_path),
                expected: "string",
            });
        };
        return edit_string(text, *offset, component);
    }

    let container = resolve_mut(document, parent_path)?;
    match (container, last) {
        (Value::Array(items), PathSegment::Index(index)) => {
            edit_list(items, *index, component, &component.p)
        }
        (Value::Object(map), PathSegment::Key(key)) => {
            if let Some(amount) = &component.na {
                let current = map
                    .get_mut(key)
                    .ok_or_else(|| ApplyError::InvalidPath(format_path(&component.p)))?;
                return add_number(current, amount, &component.p);
            }
            match (&component.od, &component.oi) {
                (_, Some(value)) => {
                    map.insert(key.clone(), value.clone());
                }
                (Some(_), None) => {
                    if map.shift_remove(key).is_none() {
                        return Err(ApplyError::InvalidPath(format_path(&component.p)));
                    }
                }
                (None, None) => {
                    return Err(ApplyError::invalid(component, "no object edit"));
                }
            }
            Ok(())
        }
        (Value::Array(_), PathSegment::Key(_)) => Err(ApplyError::TypeMismatch {
            path: format_path(&component.p),
            expected: "object",
        }),
        (Value::Object(_), PathSegment::Index(_)) => Err(ApplyError::TypeMismatch {
            path: format_path(&component.p),
            expected: "array",
        }),
        _ => Err(ApplyError::TypeMismatch {
            path: format_path(parent_path),
            expected: "array or object",
        }),
    }
}

fn apply_at_root(document: &mut Value, component: &Component) -> Result<(), ApplyError> {
    match (&component.od, &component.oi) {
        (_, Some(value)) => *document = value.clone(),
        (Some(_), None) => *document = Value::Null,
        (None, None) => {
            return Err(ApplyError::invalid(
                component,
                "only object insert/delete may target the root",
            ))
        }
    }
    Ok(())
}

fn edit_list(
    items: &mut Vec<Value>,
    index: usize,
    component: &Component,
    path: &[PathSegment],
) -> Result<(), ApplyError> {
    let len = items.len();
    let out_of_bounds = || ApplyError::IndexOutOfBounds {
        path: format_path(path),
        index,
        len,
    };

    if let Some(amount) = &component.na {
        let current = items.get_mut(index).ok_or_else(out_of_bounds)?;
        return add_number(current, amount, path);
    }

    if let Some(to) = component.lm {
        if index >= len || to >= len {
            return Err(out_of_bounds());
        }
        let item = items.remove(index);
        items.insert(to, item);
        return Ok(());
    }

    match (&component.ld, &component.li) {
        (Some(_), Some(value)) => {
            let slot = items.get_mut(index).ok_or_else(out_of_bounds)?;
            *slot = value.clone();
        }
        (Some(_), None) => {
            if index >= len {
                return Err(out_of_bounds());
            }
            items.remove(index);
        }
        (None, Some(value)) => {
            if index > len {
                return Err(out_of_bounds());
            }
            items.insert(index, value.clone());
        }
        (None, None) => return Err(ApplyError::invalid(component, "no list edit")),
    }
    Ok(())
}

fn edit_string(text: &mut String, offset: usize, component: &Component) -> Result<(), ApplyError> {
    let at = utf16_to_byte_offset(text, offset).ok_or_else(|| ApplyError::IndexOutOfBounds {
        path: format_path(&component.p),
        index: offset,
        len: text.encode_utf16().count(),
    })?;

    if let Some(deleted) = &component.sd {
        if !text[at..].starts_with(deleted.as_str()) {
            return Err(ApplyError::DeleteMismatch(format_path(&component.p)));
        }
        text.replace_range(at..at + deleted.len(), "");
    }
    if let Some(inserted) = &component.si {
        text.insert_str(at, inserted);
    }
    Ok(())
}

fn add_number(current: &mut Value, amount: &Value, path: &[PathSegment]) -> Result<(), ApplyError> {
    let mismatch = || ApplyError::TypeMismatch {
        path: format_path(path),
        expected: "number",
    };
    let overflow = || ApplyError::NumberOverflow(format_path(path));
    let sum = match (current.as_i64(), amount.as_i64()) {
        (Some(a), Some(b)) => Value::from(a.checked_add(b).ok_or_else(overflow)?),
        _ => {
            let a = current.as_f64().ok_or_else(mismatch)?;
            let b = amount.as_f64().ok_or_else(mismatch)?;
            let sum = a + b;
            if !sum.is_finite() {
                return Err(overflow());
            }
            Value::from(sum)
        }
    };
    *current = sum;
    Ok(())
}

fn resolve_mut<'a>(
    document: &'a mut Value,
    path: &[PathSegment],
) -> Result<&'a mut Value, ApplyError> {
    let mut current = document;
    for (depth, segment) in path.iter().enumerate() {
        let next = match (current, segment) {
            (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            _ => None,
        };
        current = next.ok_or_else(|| ApplyError::InvalidPath(format_path(&path[..=depth])))?;
    }
    Ok(current)
}

/// Convert a UTF-16 code unit offset into a byte offset.
fn utf16_to_byte_offset(text: &str, offset: usize) -> Option<usize> {
    let mut units = 0;
    for (byte, ch) in text.char_indices() {
        if units == offset {
            return Some(byte);
        }
        units += ch.len_utf16();
    }
    (units == offset).then_some(text.len())
}

/// Length of a string in UTF-16 code units, the unit `json0` offsets use.
#[must_use]
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

fn format_path(path: &[PathSegment]) -> String {
    let segments: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("/{}", segments.join("/"))
}

/// Errors applying an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Path does not resolve in the document
    #[error("path {0} does not exist")]
    InvalidPath(String),
    /// List or string index out of bounds
    #[error("index {index} out of bounds at {path} (length {len})")]
    IndexOutOfBounds {
        /// Component path
        path: String,
        /// Offending index
        index: usize,
        /// Length of the target
        len: usize,
    },
    /// Target has the wrong JSON type
    #[error("expected {expected} at {path}")]
    TypeMismatch {
        /// Target path
        path: String,
        /// Expected JSON type
        expected: &'static str,
    },
    /// Deleted text does not match the document
    #[error("deleted text does not match document at {0}")]
    DeleteMismatch(String),
    /// Number addition leaves the representable range
    #[error("number overflow at {0}")]
    NumberOverflow(String),
    /// Component carries no usable edit
    #[error("invalid component at {path}: {reason}")]
    InvalidComponent {
        /// Component path
        path: String,
        /// What is wrong with it
        reason: &'static str,
    },
}

impl ApplyError {
    fn invalid(component: &Component, reason: &'static str) -> Self {
        Self::InvalidComponent {
            path: format_path(&component.p),
            reason,
        }
    }
}
