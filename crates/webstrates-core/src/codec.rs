//! HTML codec for the canonical document tree.
//!
//! Parsing runs the html5ever tokenizer without its tree builder, so the
//! tree mirrors the markup as written, without the implied `<head>`/`<tbody>`
//! insertion a browser performs. This keeps `parse(serialize(tree)) == tree` so that
//! diffs against the remote snapshot only contain real edits.
//!
//! # Entity policy
//!
//! Text whose immediate parent is `script` or `style` is never escaped or
//! unescaped. Everywhere else `&`, `<` and `>` are escaped on output and
//! `&amp;`, `&lt;` and `&gt;` are decoded on input.

use crate::tree::{Element, Node};
use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{
    BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
};
use std::cell::{Cell, RefCell};

/// Elements rendered without children or end tag.
pub const VOID_ELEMENTS: [&str; 16] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "menuitem",
    "meta", "param", "source", "track", "wbr",
];

/// Elements whose text content is passed through verbatim.
pub const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];

/// Check whether a tag is a void element.
#[must_use]
pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

fn is_raw_text_element(tag: &str) -> bool {
    RAW_TEXT_ELEMENTS.contains(&tag)
}

/// Parse HTML into a canonical tree.
///
/// With `preserve_entities` set only `&gt;`, `&lt;` and `&amp;` are decoded
/// in text; otherwise every named or numeric character reference the decoder
/// knows is decoded as well. Text directly under `script`/`style` is kept
/// verbatim in both modes.
///
/// # Errors
///
/// Returns [`CodecError::MalformedMarkup`] if the markup is empty, contains an
/// unterminated tag, comment or attribute value, or does not have exactly one
/// root node.
pub fn parse(html: &str, preserve_entities: bool) -> Result<Node, CodecError> {
    let source = html.trim();
    if source.is_empty() {
        return Err(CodecError::malformed(0, "empty document"));
    }

    let roots = tokenize(source)?;
    let mut root = single_root(roots)?;
    decode_entities(&mut root, None, preserve_entities);
    Ok(root)
}

/// Render a tree as HTML.
///
/// # Errors
///
/// Returns [`CodecError::SerializationFailure`] if an element has an empty tag
/// name or a void element has children.
pub fn serialize(node: &Node) -> Result<String, CodecError> {
    let mut out = String::new();
    write_node(&mut out, node, None)?;
    Ok(out)
}

fn write_node(out: &mut String, node: &Node, parent: Option<&str>) -> Result<(), CodecError> {
    match node {
        Node::Text(text) => {
            if parent.is_some_and(is_raw_text_element) {
                out.push_str(text);
            } else {
                escape_into(out, text, false);
            }
        }
        Node::Element(element) => {
            if element.tag.is_empty() {
                return Err(CodecError::SerializationFailure(
                    "element with empty tag name".to_string(),
                ));
            }

            out.push('<');
            out.push_str(&element.tag);
            for (name, value) in &element.attributes {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                escape_into(out, value, true);
                out.push('"');
            }

            if is_void_element(&element.tag) {
                if !element.children.is_empty() {
                    return Err(CodecError::SerializationFailure(format!(
                        "void element <{}> has {} children",
                        element.tag,
                        element.children.len()
                    )));
                }
                out.push_str("/>");
                return Ok(());
            }

            out.push('>');
            for child in &element.children {
                write_node(out, child, Some(element.tag.as_str()))?;
            }
            out.push_str("</");
            out.push_str(&element.tag);
            out.push('>');
        }
    }
    Ok(())
}

fn escape_into(out: &mut String, text: &str, attribute: bool) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

fn decode_entities(node: &mut Node, parent: Option<&str>, preserve_entities: bool) {
    match node {
        Node::Text(text) => {
            if parent.is_some_and(is_raw_text_element) {
                *text = text.replace("&amp;", "&");
            } else {
                *text = if preserve_entities {
                    decode_markup_entities(text)
                } else {
                    decode_all_entities(text)
                };
            }
        }
        Node::Element(element) => {
            for child in &mut element.children {
                decode_entities(child, Some(element.tag.as_str()), preserve_entities);
            }
        }
    }
}

/// Decode the three markup-significant entities.
///
/// `&amp;` goes last so that `&amp;lt;` yields `&lt;` rather than `<`.
fn decode_markup_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

fn decode_attribute_value(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Decode named and numeric character references in a single pass.
///
/// Unknown references are left untouched.
fn decode_all_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate
            .find(';')
            .filter(|&end| end <= 12)
            .and_then(|end| decode_reference(&candidate[1..end]).map(|ch| (ch, end)));

        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_reference(name: &str) -> Option<char> {
    if let Some(numeric) = name.strip_prefix('#') {
        let code = match numeric.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse().ok()?,
        };
        return char::from_u32(code);
    }

    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => None,
    }
}

fn single_root(roots: Vec<Node>) -> Result<Node, CodecError> {
    let mut significant = roots
        .into_iter()
        .filter(|node| !matches!(node, Node::Text(text) if text.trim().is_empty()));

    let root = significant
        .next()
        .ok_or_else(|| CodecError::malformed(0, "missing root element"))?;
    if significant.next().is_some() {
        return Err(CodecError::malformed(0, "more than one root node"));
    }
    Ok(root)
}

/// Run the tokenizer over `source` and build the top-level nodes.
///
/// Every `&` reaches the tokenizer as `&amp;`, so character references come
/// back as written and the entity policy above stays in charge of decoding.
fn tokenize(source: &str) -> Result<Vec<Node>, CodecError> {
    let input = BufferQueue::default();
    input.push_back(StrTendril::from(source.replace('&', "&amp;")));

    let tokenizer = Tokenizer::new(TreeBuilder::default(), TokenizerOpts::default());
    let _ = tokenizer.feed(&input);
    tokenizer.sink.at_eof.set(true);
    tokenizer.end();
    tokenizer.sink.finish(source.len())
}

/// Token sink assembling the literal tree: no implied elements, stray end
/// tags dropped, unclosed elements closed at end of input.
#[derive(Default)]
struct TreeBuilder {
    open: RefCell<Vec<Element>>,
    roots: RefCell<Vec<Node>>,
    at_eof: Cell<bool>,
    eof_error: RefCell<Option<String>>,
}

impl TokenSink for TreeBuilder {
    type Handle = ();

    fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            Token::TagToken(tag) => return self.process_tag(tag),
            Token::CharacterTokens(text) => self.push_text(&text),
            Token::NullCharacterToken => self.push_text("\0"),
            Token::ParseError(message) => {
                // Input that stops inside a tag, attribute value or comment.
                if self.at_eof.get() {
                    self.eof_error
                        .borrow_mut()
                        .get_or_insert_with(|| message.into_owned());
                } else {
                    tracing::trace!(%message, "Recovered from markup error");
                }
            }
            Token::CommentToken(_) | Token::DoctypeToken(_) | Token::EOFToken => {}
        }
        TokenSinkResult::Continue
    }
}

impl TreeBuilder {
    fn process_tag(&self, tag: Tag) -> TokenSinkResult<()> {
        if tag.kind == TagKind::EndTag {
            self.close(&tag.name);
            return TokenSinkResult::Continue;
        }

        let mut element = Element::new(&*tag.name);
        for attribute in &tag.attrs {
            element
                .attributes
                .entry(attribute.name.local.to_string())
                .or_insert_with(|| decode_attribute_value(&attribute.value));
        }

        if tag.self_closing || is_void_element(&element.tag) {
            self.push_node(Node::Element(element));
            return TokenSinkResult::Continue;
        }

        let raw = match element.tag.as_str() {
            "script" => Some(RawKind::ScriptData),
            "style" => Some(RawKind::Rawtext),
            _ => None,
        };
        self.open.borrow_mut().push(element);
        raw.map_or(TokenSinkResult::Continue, TokenSinkResult::RawData)
    }

    fn close(&self, name: &str) {
        let (index, depth) = {
            let open = self.open.borrow();
            (open.iter().rposition(|element| element.tag == name), open.len())
        };
        match index {
            Some(index) => {
                for _ in index..depth {
                    self.close_innermost();
                }
            }
            None => tracing::debug!(tag = %name, "Ignoring unmatched end tag"),
        }
    }

    fn close_innermost(&self) -> bool {
        let element = self.open.borrow_mut().pop();
        match element {
            Some(element) => {
                self.push_node(Node::Element(element));
                true
            }
            None => false,
        }
    }

    fn push_node(&self, node: Node) {
        match self.open.borrow_mut().last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.borrow_mut().push(node),
        }
    }

    fn push_text(&self, text: &str) {
        let mut open = self.open.borrow_mut();
        let mut roots = self.roots.borrow_mut();
        let siblings = match open.last_mut() {
            Some(parent) => &mut parent.children,
            None => &mut *roots,
        };
        if let Some(Node::Text(previous)) = siblings.last_mut() {
            previous.push_str(text);
        } else {
            siblings.push(Node::Text(text.to_string()));
        }
    }

    fn finish(&self, end: usize) -> Result<Vec<Node>, CodecError> {
        if let Some(message) = self.eof_error.borrow_mut().take() {
            return Err(CodecError::malformed(
                end,
                format!("unexpected end of input: {message}"),
            ));
        }
        while self.close_innermost() {}
        Ok(self.roots.take())
    }
}

/// Errors raised by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The markup could not be parsed
    #[error("malformed markup at {position}: {message}")]
    MalformedMarkup {
        /// Byte offset into the trimmed input
        position: usize,
        /// What went wrong
        message: String,
    },
    /// The tree could not be rendered
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
}

impl CodecError {
    fn malformed(position: usize, message: impl Into<String>) -> Self {
        Self::MalformedMarkup {
            position,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(markup: &str) -> Node {
        parse(markup, true).unwrap()
    }

    #[test]
    fn parse_keeps_markup_literal() {
        let node = html("<html><body><div>Hello Update!</div></body></html>");
        let expected: Node = Element::new("html")
            .with_child(Element::new("body").with_child(Element::new("div").with_text("Hello Update!")))
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_lowercases_tags_and_attribute_names() {
        let node = html(r#"<DIV ID="Main" hidden>x</Div>"#);
        let expected: Node = Element::new("div")
            .with_attribute("id", "Main")
            .with_attribute("hidden", "")
            .with_text("x")
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_handles_void_and_self_closing_elements() {
        let node = html(r#"<p>a<br>b<img src='x.png'/><span/>c</p>"#);
        let expected: Node = Element::new("p")
            .with_text("a")
            .with_child(Element::new("br"))
            .with_text("b")
            .with_child(Element::new("img").with_attribute("src", "x.png"))
            .with_child(Element::new("span"))
            .with_text("c")
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_skips_comments_and_doctype() {
        let node = html("<!DOCTYPE html><html><!-- note --><body>a<!-- x -->b</body></html>");
        let expected: Node = Element::new("html")
            .with_child(Element::new("body").with_text("ab"))
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_closes_unclosed_elements_and_ignores_stray_end_tags() {
        let node = html("<div><p>one</span><p>two");
        let expected: Node = Element::new("div")
            .with_child(
                Element::new("p")
                    .with_text("one")
                    .with_child(Element::new("p").with_text("two")),
            )
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_keeps_script_content_verbatim() {
        let node = html(r#"<div><script>if (a < b && c > d) { x = "&amp;"; }</script>a &amp; b</div>"#);
        let expected: Node = Element::new("div")
            .with_child(
                Element::new("script").with_text(r#"if (a < b && c > d) { x = "&amp;"; }"#),
            )
            .with_text("a & b")
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_keeps_script_with_look_alike_end_tag() {
        let node = html(r#"<div><script>var s = "</scripts>"; run();</script></div>"#);
        let expected: Node = Element::new("div")
            .with_child(Element::new("script").with_text(r#"var s = "</scripts>"; run();"#))
            .into();
        assert_eq!(node, expected);

        let node = html("<style>p::after { content: '</styled>'; }</STYLE>");
        let expected: Node = Element::new("style")
            .with_text("p::after { content: '</styled>'; }")
            .into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_decodes_only_markup_entities_by_default() {
        let node = html("<p>&lt;b&gt; &amp;lt; &nbsp;&quot;</p>");
        let expected: Node = Element::new("p").with_text("<b> &lt; &nbsp;&quot;").into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_decodes_all_entities_when_not_preserving() {
        let node = parse("<p>&lt;&quot;&#65;&#x42;&nbsp;&bogus;</p>", false).unwrap();
        let expected: Node = Element::new("p").with_text("<\"AB\u{a0}&bogus;").into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_treats_stray_angle_bracket_as_text() {
        let node = html("<p>1 < 2</p>");
        let expected: Node = Element::new("p").with_text("1 < 2").into();
        assert_eq!(node, expected);
    }

    #[test]
    fn parse_rejects_malformed_markup() {
        for markup in [
            "",
            "   ",
            "<div class=\"x>text</div>",
            "<div",
            "<p><!-- never closed</p>",
            "<p>a</p><p>b</p>",
        ] {
            assert!(
                matches!(parse(markup, true), Err(CodecError::MalformedMarkup { .. })),
                "expected failure for {markup:?}"
            );
        }
    }

    #[test]
    fn serialize_escapes_text_but_not_script() {
        let node: Node = Element::new("html")
            .with_child(Element::new("script").with_text(r#"console.log("a&b");"#))
            .with_child(Element::new("p").with_text("a&b <c>"))
            .into();
        assert_eq!(
            serialize(&node).unwrap(),
            r#"<html><script>console.log("a&b");</script><p>a&amp;b &lt;c&gt;</p></html>"#
        );
    }

    #[test]
    fn serialize_checks_immediate_parent_only() {
        let node: Node = Element::new("style")
            .with_child(Element::new("b").with_text("x<y"))
            .into();
        assert_eq!(serialize(&node).unwrap(), "<style><b>x&lt;y</b></style>");
    }

    #[test]
    fn serialize_renders_void_elements() {
        let node: Node = Element::new("p")
            .with_child(Element::new("br"))
            .with_child(Element::new("input").with_attribute("value", "say \"hi\""))
            .into();
        assert_eq!(
            serialize(&node).unwrap(),
            r#"<p><br/><input value="say &quot;hi&quot;"/></p>"#
        );
    }

    #[test]
    fn serialize_reports_invalid_trees() {
        let node: Node = Element::new("br").with_text("oops").into();
        assert!(matches!(
            serialize(&node),
            Err(CodecError::SerializationFailure(_))
        ));
    }

    #[test]
    fn serialize_then_parse_roundtrip() {
        let node: Node = Element::new("html")
            .with_attribute("__wid", "czikS1SO")
            .with_text("\n  ")
            .with_child(
                Element::new("body")
                    .with_attribute("data-note", "a < b & \"c\"")
                    .with_child(Element::new("div").with_text("5 > 3 & 2 < 4"))
                    .with_child(Element::new("hr"))
                    .with_child(Element::new("style").with_text("a > b { color: red; }")),
            )
            .into();

        let markup = serialize(&node).unwrap();
        assert_eq!(parse(&markup, true).unwrap(), node);
    }
}
