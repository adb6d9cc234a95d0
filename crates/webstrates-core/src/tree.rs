//! Canonical document tree and its JsonML wire form.
//!
//! Documents are stored remotely as JsonML: `["tag", {attributes}, child...]`
//! where text children are plain JSON strings. Locally they are handled as a
//! tagged [`Node`] tree so that codec and diff code can pattern-match instead
//! of inspecting array lengths and value types.

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Attribute mapping of an element.
///
/// Equality ignores order; insertion order is kept for rendering.
pub type Attributes = IndexMap<String, String>;

/// A node of the canonical document tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Opaque text leaf
    Text(String),
    /// Element with tag, attributes and children
    Element(Element),
}

/// An element node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Lower-cased tag name
    pub tag: String,
    /// Attributes (always present, possibly empty)
    pub attributes: Attributes,
    /// Ordered children
    pub children: Vec<Node>,
}

impl Element {
    /// Create an element without attributes or children.
    ///
    /// The tag name is lower-cased.
    #[must_use]
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self {
            tag: tag.as_ref().to_lowercase(),
            attributes: Attributes::new(),
            children: Vec::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Append a child node.
    #[must_use]
    pub fn with_child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Append a text child.
    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_child(Node::Text(text.into()))
    }
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Node::Element(element)
    }
}

impl Node {
    /// Create a text node.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }

    /// The minimal document every webstrate starts from:
    /// `<html><body></body></html>`.
    #[must_use]
    pub fn skeleton() -> Self {
        Element::new("html").with_child(Element::new("body")).into()
    }

    /// Tag name if this is an element.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Node::Element(element) => Some(element.tag.as_str()),
            Node::Text(_) => None,
        }
    }

    /// Convert JsonML into a typed tree.
    ///
    /// The input is normalized first, so loosely shaped JsonML (missing or
    /// misplaced attributes, upper-case tags) is accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the value is empty or is not a JsonML node.
    pub fn from_jsonml(value: &Value) -> Result<Self, TreeError> {
        from_canonical(&normalize(value))
    }

    /// Render as canonical JsonML.
    #[must_use]
    pub fn to_jsonml(&self) -> Value {
        match self {
            Node::Text(text) => Value::String(text.clone()),
            Node::Element(element) => {
                let attributes: Map<String, Value> = element
                    .attributes
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                    .collect();
                let mut items = Vec::with_capacity(element.children.len() + 2);
                items.push(Value::String(element.tag.clone()));
                items.push(Value::Object(attributes));
                items.extend(element.children.iter().map(Node::to_jsonml));
                Value::Array(items)
            }
        }
    }
}

/// Read a snapshot's data as a tree.
///
/// Missing, `null` and empty-array snapshots yield `None`.
///
/// # Errors
///
/// Returns error if the data is present but is not valid JsonML.
pub fn tree_from_snapshot(data: Option<&Value>) -> Result<Option<Node>, TreeError> {
    match data.map(normalize) {
        None => Ok(None),
        Some(Value::Array(items)) if items.is_empty() => Ok(None),
        Some(value) => from_canonical(&value).map(Some),
    }
}

/// Normalize loosely shaped JsonML into canonical JsonML.
///
/// - tag names are lower-cased
/// - a missing or `null` attributes slot becomes `{}`
/// - a non-object second element is pushed back into the children
/// - `null` and `[]` become `[]`, strings are returned unchanged
///
/// Normalizing canonical JsonML is a no-op.
#[must_use]
pub fn normalize(value: &Value) -> Value {
    let items = match value {
        Value::Null => return Value::Array(Vec::new()),
        Value::Array(items) if items.is_empty() => return Value::Array(Vec::new()),
        Value::Array(items) => items,
        other => return other.clone(),
    };

    let tag = match &items[0] {
        Value::String(tag) => Value::String(tag.to_lowercase()),
        other => other.clone(),
    };

    let (attributes, rest) = match items.get(1) {
        Some(Value::Object(attributes)) => (attributes.clone(), &items[2..]),
        Some(Value::Null) => (Map::new(), &items[2..]),
        Some(_) => (Map::new(), &items[1..]),
        None => (Map::new(), &items[1..]),
    };

    let mut normalized = Vec::with_capacity(rest.len() + 2);
    normalized.push(tag);
    normalized.push(Value::Object(attributes));
    normalized.extend(rest.iter().map(normalize));
    Value::Array(normalized)
}

fn from_canonical(value: &Value) -> Result<Node, TreeError> {
    match value {
        Value::String(text) => Ok(Node::Text(text.clone())),
        Value::Array(items) if items.is_empty() => Err(TreeError::Empty),
        Value::Array(items) => {
            let tag = items[0]
                .as_str()
                .ok_or_else(|| TreeError::InvalidTag(items[0].to_string()))?;
            if tag.is_empty() {
                return Err(TreeError::InvalidTag(String::new()));
            }

            let mut element = Element::new(tag);
            if let Some(Value::Object(attributes)) = items.get(1) {
                for (name, value) in attributes {
                    let value = match value {
                        Value::String(value) => value.clone(),
                        Value::Number(number) => number.to_string(),
                        Value::Bool(flag) => flag.to_string(),
                        _ => {
                            return Err(TreeError::InvalidAttribute {
                                tag: element.tag,
                                name: name.clone(),
                            })
                        }
                    };
                    element.attributes.insert(name.clone(), value);
                }
            }

            for child in items.iter().skip(2) {
                element.children.push(from_canonical(child)?);
            }
            Ok(Node::Element(element))
        }
        other => Err(TreeError::InvalidNode(other.to_string())),
    }
}

/// Errors converting JsonML into a tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// The value holds no node
    #[error("empty JsonML value")]
    Empty,
    /// Tag name is missing or not a string
    #[error("invalid tag name: {0}")]
    InvalidTag(String),
    /// Attribute value is not a scalar
    #[error("invalid value for attribute '{name}' on <{tag}>")]
    InvalidAttribute {
        /// Element tag
        tag: String,
        /// Attribute name
        name: String,
    },
    /// Value is neither a string nor an array
    #[error("invalid JsonML node: {0}")]
    InvalidNode(String),
}
