//! Rebuilding a bare function header from source, and the imports it needs.

use crate::error::{CodespeakError, Result};
use crate::syntax::{self, node_text, Definition};
use crate::types::annotation::{self, Annotation};
use crate::types::scope::{from_import_names, Binding, ModuleScope};
use crate::types::{Classifier, TypeDefinition};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tree_sitter::Node;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter text as written, minus comments.
    pub text: String,
    /// Bound name without `*`/`**`; empty for the bare `*` and `/` separators.
    pub name: String,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHeader {
    pub name: String,
    pub is_async: bool,
    pub parameters: Vec<Parameter>,
    pub return_annotation: Option<String>,
}

impl FunctionHeader {
    pub fn from_definition(def: &Definition, source: &str) -> Result<Self> {
        let node = def.node;
        let name = def
            .name(source)
            .ok_or_else(|| CodespeakError::Extraction("function has no name".to_string()))?
            .to_string();
        let is_async = node.child(0).is_some_and(|c| c.kind() == "async");
        let params_node = node.child_by_field_name("parameters").ok_or_else(|| {
            CodespeakError::Extraction(format!("function {} has no parameter list", name))
        })?;

        let mut parameters = Vec::new();
        let mut cursor = params_node.walk();
        for child in params_node.children(&mut cursor) {
            if matches!(child.kind(), "(" | ")" | "," | "comment") {
                continue;
            }
            parameters.push(parameter(child, source));
        }

        Ok(Self {
            name,
            is_async,
            parameters,
            return_annotation: node
                .child_by_field_name("return_type")
                .map(|n| node_text(&n, source).to_string()),
        })
    }

    /// `def name(params) -> ret:` with the body dropped.
    pub fn render(&self) -> String {
        let params: Vec<&str> = self.parameters.iter().map(|p| p.text.as_str()).collect();
        let mut header = format!(
            "{}def {}({})",
            if self.is_async { "async " } else { "" },
            self.name,
            params.join(", ")
        );
        if let Some(ret) = &self.return_annotation {
            header.push_str(" -> ");
            header.push_str(ret);
        }
        header.push(':');
        header
    }

    pub fn first_parameter(&self) -> Option<&Parameter> {
        self.parameters.first()
    }

    /// Parameter annotations followed by the return annotation.
    pub fn annotations(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter_map(|p| p.annotation.as_deref())
            .chain(self.return_annotation.as_deref())
    }
}

fn parameter(node: Node, source: &str) -> Parameter {
    let text = strip_comments(node, source);
    let field = |name: &str| node.child_by_field_name(name).map(|n| node_text(&n, source).to_string());
    let (name, annotation) = match node.kind() {
        "typed_parameter" => {
            let bound = node
                .named_child(0)
                .map(|n| node_text(&n, source).to_string())
                .unwrap_or_default();
            (bound, field("type"))
        }
        "default_parameter" => (field("name").unwrap_or_default(), None),
        "typed_default_parameter" => (field("name").unwrap_or_default(), field("type")),
        "keyword_separator" | "positional_separator" => (String::new(), None),
        _ => (text.clone(), None),
    };
    Parameter {
        text,
        name: name.trim_start_matches('*').to_string(),
        annotation,
    }
}

fn strip_comments(node: Node, source: &str) -> String {
    let mut text = node_text(&node, source).to_string();
    let mut comments = Vec::new();
    collect_comments(node, &mut comments);
    for comment in comments.iter().rev() {
        let start = comment.start_byte() - node.start_byte();
        let end = comment.end_byte() - node.start_byte();
        text.replace_range(start..end, "");
    }
    text
}

fn collect_comments<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "comment" {
            out.push(child);
        } else {
            collect_comments(child, out);
        }
    }
}

fn self_parameter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\(\s*self\s*([,)])").unwrap_or_else(|e| panic!("invalid pattern: {e}"))
    })
}

/// Annotate an unannotated leading `self` parameter with the receiver class.
pub fn insert_self_type(signature: &str, class_name: &str) -> String {
    self_parameter_pattern()
        .replacen(signature, 1, format!("(self: {}${{1}}", class_name).as_str())
        .into_owned()
}

/// The header must parse as a complete function once given a body.
pub fn validate(signature: &str) -> Result<()> {
    let stub = format!("{}\n    ...\n", signature);
    let tree = syntax::parse_python(&stub)?;
    if tree.root_node().has_error() {
        return Err(CodespeakError::Extraction(format!(
            "rebuilt signature does not parse: {}",
            signature
        )));
    }
    Ok(())
}

/// `from x import y` statements found in a function body, normalised to absolute modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyImports {
    pub statements: Vec<String>,
    #[serde(skip)]
    pub types: Vec<TypeDefinition>,
}

impl BodyImports {
    pub fn collect(def: &Definition, scope: &ModuleScope, classifier: &mut Classifier) -> Result<Self> {
        let mut imports = BodyImports::default();
        let Some(body) = def.node.child_by_field_name("body") else {
            return Ok(imports);
        };
        let mut nodes = Vec::new();
        collect_import_nodes(body, &mut nodes);

        for node in nodes {
            if node.kind() == "import_statement" {
                return Err(CodespeakError::Extraction(format!(
                    "`{}`: whole module imports are not supported in function bodies, use `from ... import ...`",
                    node_text(&node, &scope.source)
                )));
            }
            let Some(module) = scope.from_import_module(node, &scope.source) else {
                continue;
            };
            let names = from_import_names(node, &scope.source);
            if names.is_empty() {
                continue;
            }
            let rendered: Vec<String> = names
                .iter()
                .map(|(name, alias)| match alias {
                    Some(alias) => format!("{} as {}", name, alias),
                    None => name.clone(),
                })
                .collect();
            imports
                .statements
                .push(format!("from {} import {}", module, rendered.join(", ")));

            for (name, alias) in &names {
                if alias.is_some() {
                    tracing::warn!(module = %module, name = %name, "aliased body imports are not described to the model");
                    continue;
                }
                match classifier.classify_symbol(&module, name) {
                    Ok(def) => imports.types.push(def),
                    Err(err) => tracing::warn!("skipping body import {}.{}: {}", module, name, err),
                }
            }
        }
        Ok(imports)
    }
}

fn collect_import_nodes<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "import_statement" | "import_from_statement" => out.push(child),
            _ => collect_import_nodes(child, out),
        }
    }
}

/// How the names used in the signature's annotations are bound in the declaring module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureBindings {
    /// `(module, name)` pairs importable as `from module import name`.
    pub symbols: BTreeSet<(String, String)>,
    /// Module imports and renamed symbols, rendered as written.
    pub lines: BTreeSet<String>,
}

/// Resolve each annotation head through the module scope so the incomplete file binds the
/// same names the signature uses, including `typing` constructs like `Optional` that
/// classify to plain unions.
pub fn signature_bindings(header: &FunctionHeader, scope: &ModuleScope) -> SignatureBindings {
    let mut heads = BTreeSet::new();
    for text in header.annotations() {
        if let Ok(parsed) = annotation::parse(text) {
            collect_heads(&parsed, &mut heads);
        }
    }

    let mut bindings = SignatureBindings::default();
    for head in heads {
        match scope.binding(&head) {
            Some(Binding::Module(module)) if *module == head => {
                bindings.lines.insert(format!("import {}", module));
            }
            Some(Binding::Module(module)) => {
                bindings.lines.insert(format!("import {} as {}", module, head));
            }
            Some(Binding::Symbol { module, name }) if *name != head => {
                bindings
                    .lines
                    .insert(format!("from {} import {} as {}", module, name, head));
            }
            Some(Binding::Symbol { module, name }) => {
                bindings.symbols.insert((module.clone(), name.clone()));
            }
            None => {
                if scope.class(&head).is_some() || scope.assignment(&head).is_some() {
                    bindings.symbols.insert((scope.module.clone(), head));
                }
            }
        }
    }
    bindings
}

fn collect_heads(annotation: &Annotation, out: &mut BTreeSet<String>) {
    let head = |dotted: &str| dotted.split('.').next().unwrap_or(dotted).to_string();
    match annotation {
        Annotation::Name(name) => {
            out.insert(head(name));
        }
        Annotation::Subscript { base, args } => {
            out.insert(head(base));
            // Literal values are not names.
            if !base.ends_with("Literal") {
                for arg in args {
                    collect_heads(arg, out);
                }
            }
        }
        Annotation::List(items) | Annotation::Union(items) => {
            for item in items {
                collect_heads(item, out);
            }
        }
        Annotation::Str(text) => {
            if let Ok(parsed) = annotation::parse(text) {
                collect_heads(&parsed, out);
            }
        }
        Annotation::None | Annotation::Ellipsis | Annotation::Literal(_) => {}
    }
}
