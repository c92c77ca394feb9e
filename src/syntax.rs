//! Tree-sitter helpers for reading Python source

use crate::error::{CodespeakError, Result};
use crate::util::{dedent, line_start};
use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};

// Parsers are expensive to create; keep one per thread and reuse it.
thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

pub fn parse_python(source: &str) -> Result<Tree> {
    PYTHON_PARSER
        .with(|p| p.borrow_mut().parse(source, None))
        .ok_or_else(|| CodespeakError::Extraction("failed to parse python source".to_string()))
}

pub fn node_text<'s>(node: &Node, source: &'s str) -> &'s str {
    &source[node.start_byte()..node.end_byte()]
}

/// A function or class definition, together with its decorated wrapper when present.
#[derive(Debug, Clone, Copy)]
pub struct Definition<'t> {
    pub node: Node<'t>,
    pub outer: Node<'t>,
}

impl<'t> Definition<'t> {
    pub fn kind(&self) -> &'static str {
        self.node.kind()
    }

    pub fn is_class(&self) -> bool {
        self.node.kind() == "class_definition"
    }

    pub fn name<'s>(&self, source: &'s str) -> Option<&'s str> {
        self.node
            .child_by_field_name("name")
            .map(|n| node_text(&n, source))
    }

    /// Dedented source text including decorators.
    pub fn source(&self, source: &str) -> String {
        let start = line_start(source, self.outer.start_byte());
        dedent(&source[start..self.outer.end_byte()])
    }
}

/// Unwrap a block-level statement into a definition, if it is one.
pub fn as_definition(node: Node<'_>) -> Option<Definition<'_>> {
    match node.kind() {
        "function_definition" | "class_definition" => Some(Definition { node, outer: node }),
        "decorated_definition" => {
            let inner = node.child_by_field_name("definition")?;
            Some(Definition {
                node: inner,
                outer: node,
            })
        }
        _ => None,
    }
}

/// Definitions directly inside a module or a class/function body.
pub fn child_definitions<'t>(container: Node<'t>) -> Vec<Definition<'t>> {
    let body = if container.kind() == "module" {
        Some(container)
    } else {
        container.child_by_field_name("body")
    };
    let Some(body) = body else {
        return Vec::new();
    };
    let mut cursor = body.walk();
    let definitions = body
        .named_children(&mut cursor)
        .filter_map(as_definition)
        .collect();
    definitions
}

/// Walk a dotted qualified name (`Outer.method`) through nested definitions.
pub fn find_definition<'t>(root: Node<'t>, source: &str, qualname: &str) -> Option<Definition<'t>> {
    let mut container = root;
    let mut found = None;
    for segment in qualname.split('.') {
        let def = child_definitions(container)
            .into_iter()
            .find(|d| d.name(source) == Some(segment))?;
        container = def.node;
        found = Some(def);
    }
    found
}

/// The cleaned docstring of a function or class definition.
pub fn docstring(def: &Definition, source: &str) -> Option<String> {
    let body = def.node.child_by_field_name("body")?;
    let mut cursor = body.walk();
    let first = body
        .named_children(&mut cursor)
        .find(|n| n.kind() != "comment")?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let literal = first.named_child(0)?;
    if literal.kind() != "string" {
        return None;
    }
    Some(clean_docstring(string_contents(node_text(&literal, source))))
}

/// Strip prefix and quotes from a Python string literal.
pub fn string_contents(literal: &str) -> &str {
    let unprefixed = literal.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if unprefixed.len() >= 2 * quote.len()
            && unprefixed.starts_with(quote)
            && unprefixed.ends_with(quote)
        {
            return &unprefixed[quote.len()..unprefixed.len() - quote.len()];
        }
    }
    unprefixed
}

/// Normalise docstring indentation the way `inspect.cleandoc` does.
pub fn clean_docstring(raw: &str) -> String {
    let expanded = raw.replace('\t', "        ");
    let lines: Vec<&str> = expanded.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let margin = lines[1..]
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<&str> = Vec::with_capacity(lines.len());
    cleaned.push(lines[0].trim_start());
    for line in &lines[1..] {
        cleaned.push(if line.len() >= margin {
            line[margin..].trim_end()
        } else {
            line.trim()
        });
    }
    while cleaned.first().is_some_and(|l| l.trim().is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.trim().is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
import os

class Shape:
    """A shape."""

    @property
    def area(self) -> float:
        return 0.0

    class Corner:
        def angle(self) -> int:
            """
            Angle in degrees.

                Always positive.
            """
            return 90

def free(x):
    return x
"#;

    #[test]
    fn finds_nested_definitions() {
        let tree = parse_python(SOURCE).unwrap();
        let root = tree.root_node();

        let area = find_definition(root, SOURCE, "Shape.area").unwrap();
        assert_eq!(area.kind(), "function_definition");
        assert_eq!(area.outer.kind(), "decorated_definition");
        assert!(area.source(SOURCE).starts_with("@property\ndef area"));

        let angle = find_definition(root, SOURCE, "Shape.Corner.angle").unwrap();
        assert_eq!(angle.name(SOURCE), Some("angle"));
        assert!(find_definition(root, SOURCE, "Shape.missing").is_none());
        assert!(find_definition(root, SOURCE, "free").is_some());
    }

    #[test]
    fn extracts_cleaned_docstrings() {
        let tree = parse_python(SOURCE).unwrap();
        let root = tree.root_node();

        let shape = find_definition(root, SOURCE, "Shape").unwrap();
        assert!(shape.is_class());
        assert_eq!(docstring(&shape, SOURCE).as_deref(), Some("A shape."));

        let angle = find_definition(root, SOURCE, "Shape.Corner.angle").unwrap();
        assert_eq!(
            docstring(&angle, SOURCE).as_deref(),
            Some("Angle in degrees.\n\n    Always positive.")
        );

        let free = find_definition(root, SOURCE, "free").unwrap();
        assert!(docstring(&free, SOURCE).is_none());
    }

    #[test]
    fn string_contents_handles_prefixes() {
        assert_eq!(string_contents("r'''raw'''"), "raw");
        assert_eq!(string_contents("\"plain\""), "plain");
        assert_eq!(string_contents("''"), "");
    }
}
