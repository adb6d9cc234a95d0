//! Tree differ.
//!
//! Produces the ordered `json0` components that turn one canonical tree
//! into another. Paths address the JsonML form: index `1` is the attribute
//! object and child `n` lives at index `n + 2`.

use crate::json0::{utf16_len, Component, PathSegment};
use crate::tree::{Element, Node};

/// Offset of the first child inside a JsonML element array.
const CHILD_OFFSET: usize = 2;

/// Index of the attribute object inside a JsonML element array.
const ATTRIBUTES_INDEX: usize = 1;

/// Compute the operation transforming `old` into `new`.
///
/// With no previous tree the result is a single root insert. Components
/// are ordered so that applying them one after another yields `new`.
#[must_use]
pub fn diff(old: Option<&Node>, new: &Node) -> Vec<Component> {
    let mut components = Vec::new();
    match old {
        None => components.push(Component::object_insert(Vec::new(), new.to_jsonml())),
        Some(old) => diff_node(old, new, &mut Vec::new(), &mut components),
    }
    components
}

/// The operation that discards the document and replaces it with
/// `<html><body></body></html>`.
#[must_use]
pub fn skeleton_reset() -> Vec<Component> {
    vec![Component::object_insert(
        Vec::new(),
        Node::skeleton().to_jsonml(),
    )]
}

fn diff_node(old: &Node, new: &Node, path: &mut Vec<PathSegment>, out: &mut Vec<Component>) {
    match (old, new) {
        (Node::Text(old_text), Node::Text(new_text)) => {
            if old_text != new_text {
                diff_text(old_text, new_text, path, out);
            }
        }
        (Node::Element(old_element), Node::Element(new_element))
            if old_element.tag == new_element.tag =>
        {
            diff_attributes(old_element, new_element, path, out);
            diff_children(old_element, new_element, path, out);
        }
        _ => out.push(replace(path, old, new)),
    }
}

fn replace(path: &[PathSegment], old: &Node, new: &Node) -> Component {
    if path.is_empty() {
        Component::object_replace(Vec::new(), old.to_jsonml(), new.to_jsonml())
    } else {
        Component::list_replace(path.to_vec(), old.to_jsonml(), new.to_jsonml())
    }
}

fn diff_text(old: &str, new: &str, path: &[PathSegment], out: &mut Vec<Component>) {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let head: String = old_chars[..prefix].iter().collect();
    let removed: String = old_chars[prefix..old_chars.len() - suffix].iter().collect();
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut at = path.to_vec();
    at.push(PathSegment::Index(utf16_len(&head)));

    if !removed.is_empty() {
        out.push(Component::string_delete(at.clone(), removed));
    }
    if !inserted.is_empty() {
        out.push(Component::string_insert(at, inserted));
    }
}

fn diff_attributes(old: &Element, new: &Element, path: &[PathSegment], out: &mut Vec<Component>) {
    let attribute_path = |name: &str| {
        let mut at = path.to_vec();
        at.push(PathSegment::Index(ATTRIBUTES_INDEX));
        at.push(PathSegment::Key(name.to_string()));
        at
    };

    for (name, value) in &old.attributes {
        if !new.attributes.contains_key(name) {
            out.push(Component::object_delete(
                attribute_path(name),
                value.clone().into(),
            ));
        }
    }

    for (name, value) in &new.attributes {
        match old.attributes.get(name) {
            None => out.push(Component::object_insert(
                attribute_path(name),
                value.clone().into(),
            )),
            Some(previous) if previous != value => out.push(Component::object_replace(
                attribute_path(name),
                previous.clone().into(),
                value.clone().into(),
            )),
            Some(_) => {}
        }
    }
}

fn diff_children(
    old: &Element,
    new: &Element,
    path: &mut Vec<PathSegment>,
    out: &mut Vec<Component>,
) {
    let old_children = &old.children;
    let new_children = &new.children;

    let prefix = old_children
        .iter()
        .zip(new_children)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old_children.len().min(new_children.len()) - prefix;
    let suffix = old_children
        .iter()
        .rev()
        .zip(new_children.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let old_window = &old_children[prefix..old_children.len() - suffix];
    let new_window = &new_children[prefix..new_children.len() - suffix];
    let paired = old_window.len().min(new_window.len());

    for (offset, (old_child, new_child)) in old_window.iter().zip(new_window).enumerate() {
        path.push(PathSegment::Index(prefix + offset + CHILD_OFFSET));
        diff_node(old_child, new_child, path, out);
        path.pop();
    }

    let surplus_at = prefix + paired + CHILD_OFFSET;
    for removed in &old_window[paired..] {
        let mut at = path.clone();
        at.push(PathSegment::Index(surplus_at));
        out.push(Component::list_delete(at, removed.to_jsonml()));
    }
    for (offset, added) in new_window[paired..].iter().enumerate() {
        let mut at = path.clone();
        at.push(PathSegment::Index(surplus_at + offset));
        out.push(Component::list_insert(at, added.to_jsonml()));
    }
}
