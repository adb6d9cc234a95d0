//! Commands that work on local files only.

use anyhow::{Context, Result};
use std::path::Path;
use webstrates_core::{diff, parse, serialize, Node};

/// Read and parse an HTML file, preserving entities outside markup.
///
/// # Errors
///
/// Returns error if the file cannot be read or does not parse.
pub fn read_tree(path: &Path) -> Result<Node> {
    let html = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse(&html, true).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Canonical rendering of an HTML file.
///
/// # Errors
///
/// Returns error if the file cannot be read, parsed or rendered.
pub fn normalize_file(path: &Path) -> Result<String> {
    let tree = read_tree(path)?;
    serialize(&tree).context("Failed to render document")
}

/// The `json0` operation turning the document in `from` into the one in `to`.
///
/// # Errors
///
/// Returns error if either file cannot be read or parsed.
pub fn diff_files(from: &Path, to: &Path) -> Result<String> {
    let old = read_tree(from)?;
    let new = read_tree(to)?;
    let op = diff(Some(&old), &new);
    serde_json::to_string_pretty(&op).context("Failed to encode operation")
}

/// Copy of the document without its `<head>`.
pub fn without_head(tree: &mut Node) -> Node {
    match tree {
        Node::Element(element) => {
            let mut element = element.clone();
            element.children.retain(|child| child.tag() != Some("head"));
            Node::Element(element)
        }
        Node::Text(text) => Node::Text(text.clone()),
    }
}
