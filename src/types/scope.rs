//! Name resolution for Python modules inside a project.
//!
//! A `ModuleScope` records what a module binds at top level: imports, classes (including
//! nested ones, keyed by qualified name), functions and simple assignments. The
//! `ProjectResolver` maps dotted module names to files under the project root and caches
//! parsed scopes.

use crate::error::{CodespeakError, Result};
use crate::syntax::{self, node_text, Definition};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tree_sitter::Node;

/// Standard-library modules that are always treated as installed, even when a project
/// file happens to shadow the name.
pub const FREE_MODULES: &[&str] = &[
    "abc", "argparse", "asyncio", "base64", "collections", "contextlib", "copy", "csv",
    "dataclasses", "datetime", "decimal", "enum", "fnmatch", "fractions", "functools", "glob",
    "gzip", "hashlib", "heapq", "http", "http.server", "io", "ipaddress", "itertools", "json",
    "logging", "math", "mmap", "multiprocessing", "numbers", "operator", "os", "pathlib",
    "pickle", "platform", "queue", "random", "re", "shutil", "socket", "sqlite3", "statistics",
    "string", "struct", "subprocess", "sys", "tempfile", "threading", "time", "types", "typing",
    "typing_extensions", "unittest", "urllib", "uuid", "zipfile", "zoneinfo",
];

pub fn is_free_module(module: &str) -> bool {
    let top = module.split('.').next().unwrap_or(module);
    FREE_MODULES.contains(&module) || FREE_MODULES.contains(&top)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// `import a.b` binds `a`; `import a.b as c` binds `c` to `a.b`.
    Module(String),
    /// `from m import n as alias`
    Symbol { module: String, name: String },
}

/// Line span of a method inside its class source, relative to the first line of that source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpan {
    pub name: String,
    pub first_line: usize,
    pub last_line: usize,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub qualname: String,
    /// Dedented source including decorators.
    pub source: String,
    /// Base class expressions as written.
    pub bases: Vec<String>,
    /// Annotated class-body attributes in declaration order.
    pub attributes: Vec<(String, String)>,
    pub methods: Vec<MethodSpan>,
}

impl ClassInfo {
    /// The class source with one method removed.
    pub fn source_without_method(&self, method: &str) -> String {
        let Some(span) = self.methods.iter().find(|m| m.name == method) else {
            return self.source.clone();
        };
        let kept: Vec<&str> = self
            .source
            .lines()
            .enumerate()
            .filter(|(i, _)| *i < span.first_line || *i > span.last_line)
            .map(|(_, line)| line)
            .collect();

        let has_body = kept
            .iter()
            .any(|line| line.starts_with(char::is_whitespace) && !line.trim().is_empty());
        let mut out = kept.join("\n");
        while out.ends_with("\n\n") {
            out.pop();
        }
        if !has_body {
            out.push_str("\n    pass");
        }
        out
    }
}

#[derive(Debug)]
pub struct ModuleScope {
    pub module: String,
    pub path: PathBuf,
    pub source: String,
    is_package: bool,
    bindings: HashMap<String, Binding>,
    classes: BTreeMap<String, ClassInfo>,
    functions: HashSet<String>,
    assignments: HashMap<String, String>,
}

impl ModuleScope {
    pub fn parse(module: &str, path: &Path, source: String) -> Result<Self> {
        let tree = syntax::parse_python(&source)?;
        let is_package = path.file_name().and_then(|n| n.to_str()) == Some("__init__.py");
        let mut scope = Self {
            module: module.to_string(),
            path: path.to_path_buf(),
            source: String::new(),
            is_package,
            bindings: HashMap::new(),
            classes: BTreeMap::new(),
            functions: HashSet::new(),
            assignments: HashMap::new(),
        };
        scope.collect_statements(tree.root_node(), &source);
        scope.source = source;
        Ok(scope)
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn class(&self, qualname: &str) -> Option<&ClassInfo> {
        self.classes.get(qualname)
    }

    pub fn defines_function(&self, qualname: &str) -> bool {
        self.functions.contains(qualname)
    }

    pub fn assignment(&self, name: &str) -> Option<&str> {
        self.assignments.get(name).map(String::as_str)
    }

    /// Whether a class or function with this qualified name exists in the module.
    pub fn declares(&self, qualname: &str) -> bool {
        self.classes.contains_key(qualname) || self.functions.contains(qualname)
    }

    /// Absolute module name for a relative import with `dots` leading dots.
    pub fn resolve_relative(&self, dots: usize, rest: Option<&str>) -> String {
        let mut parts: Vec<&str> = self.module.split('.').collect();
        if !self.is_package {
            parts.pop();
        }
        for _ in 1..dots {
            parts.pop();
        }
        if let Some(rest) = rest.filter(|r| !r.is_empty()) {
            parts.push(rest);
        }
        parts.join(".")
    }

    fn collect_statements(&mut self, block: Node, source: &str) {
        let mut cursor = block.walk();
        for node in block.named_children(&mut cursor) {
            match node.kind() {
                "import_statement" => self.collect_import(node, source),
                "import_from_statement" => self.collect_from_import(node, source),
                // Conditional and guarded imports (TYPE_CHECKING, try/except ImportError)
                "if_statement" | "try_statement" | "else_clause" | "except_clause"
                | "finally_clause" | "elif_clause" | "block" => {
                    self.collect_statements(node, source)
                }
                "expression_statement" => self.collect_assignment(node, source),
                _ => {
                    if let Some(def) = syntax::as_definition(node) {
                        self.collect_definition(def, source, "");
                    }
                }
            }
        }
    }

    fn collect_import(&mut self, node: Node, source: &str) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "dotted_name" => {
                    let dotted = node_text(&child, source);
                    let top = dotted.split('.').next().unwrap_or(dotted);
                    self.bindings
                        .insert(top.to_string(), Binding::Module(top.to_string()));
                }
                "aliased_import" => {
                    if let (Some(name), Some(alias)) = (
                        child.child_by_field_name("name"),
                        child.child_by_field_name("alias"),
                    ) {
                        self.bindings.insert(
                            node_text(&alias, source).to_string(),
                            Binding::Module(node_text(&name, source).to_string()),
                        );
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_from_import(&mut self, node: Node, source: &str) {
        let Some(module) = self.from_import_module(node, source) else {
            return;
        };
        for (name, alias) in from_import_names(node, source) {
            self.bindings.insert(
                alias.unwrap_or_else(|| name.clone()),
                Binding::Symbol {
                    module: module.clone(),
                    name,
                },
            );
        }
    }

    /// Absolute module of a `from ... import ...` statement.
    pub fn from_import_module(&self, node: Node, source: &str) -> Option<String> {
        let module_node = node.child_by_field_name("module_name")?;
        if module_node.kind() != "relative_import" {
            return Some(node_text(&module_node, source).to_string());
        }
        let mut dots = 0;
        let mut rest = None;
        let mut cursor = module_node.walk();
        for child in module_node.children(&mut cursor) {
            match child.kind() {
                "import_prefix" => dots = node_text(&child, source).matches('.').count(),
                "dotted_name" => rest = Some(node_text(&child, source)),
                _ => {}
            }
        }
        Some(self.resolve_relative(dots.max(1), rest))
    }

    fn collect_assignment(&mut self, node: Node, source: &str) {
        let Some(assignment) = node.named_child(0).filter(|n| n.kind() == "assignment") else {
            return;
        };
        let (Some(left), Some(right)) = (
            assignment.child_by_field_name("left"),
            assignment.child_by_field_name("right"),
        ) else {
            return;
        };
        if left.kind() == "identifier" {
            self.assignments.insert(
                node_text(&left, source).to_string(),
                node_text(&right, source).to_string(),
            );
        }
    }

    fn collect_definition(&mut self, def: Definition, source: &str, prefix: &str) {
        let Some(name) = def.name(source) else {
            return;
        };
        let qualname = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        };

        if !def.is_class() {
            self.functions.insert(qualname);
            return;
        }

        let base_row = def.outer.start_position().row;
        let mut info = ClassInfo {
            qualname: qualname.clone(),
            source: def.source(source),
            bases: class_bases(def.node, source),
            attributes: Vec::new(),
            methods: Vec::new(),
        };

        if let Some(body) = def.node.child_by_field_name("body") {
            let mut cursor = body.walk();
            for child in body.named_children(&mut cursor) {
                if child.kind() == "expression_statement" {
                    if let Some(attr) = annotated_attribute(child, source) {
                        info.attributes.push(attr);
                    }
                    continue;
                }
                let Some(inner) = syntax::as_definition(child) else {
                    continue;
                };
                if !inner.is_class() {
                    if let Some(method) = inner.name(source) {
                        info.methods.push(MethodSpan {
                            name: method.to_string(),
                            first_line: inner.outer.start_position().row - base_row,
                            last_line: inner.outer.end_position().row - base_row,
                        });
                    }
                }
                self.collect_definition(inner, source, &qualname);
            }
        }

        self.classes.insert(qualname, info);
    }
}

/// `(name, alias)` pairs imported by a `from ... import ...` statement.
pub fn from_import_names(node: Node, source: &str) -> Vec<(String, Option<String>)> {
    let mut names = Vec::new();
    let mut cursor = node.walk();
    for child in node.children_by_field_name("name", &mut cursor) {
        match child.kind() {
            "dotted_name" => names.push((node_text(&child, source).to_string(), None)),
            "aliased_import" => {
                if let (Some(name), Some(alias)) = (
                    child.child_by_field_name("name"),
                    child.child_by_field_name("alias"),
                ) {
                    names.push((
                        node_text(&name, source).to_string(),
                        Some(node_text(&alias, source).to_string()),
                    ));
                }
            }
            _ => {}
        }
    }
    names
}

fn class_bases(class_node: Node, source: &str) -> Vec<String> {
    let Some(args) = class_node.child_by_field_name("superclasses") else {
        return Vec::new();
    };
    let mut cursor = args.walk();
    let bases = args
        .named_children(&mut cursor)
        .filter(|n| !matches!(n.kind(), "keyword_argument" | "comment"))
        .map(|n| node_text(&n, source).to_string())
        .collect();
    bases
}

fn annotated_attribute(statement: Node, source: &str) -> Option<(String, String)> {
    let assignment = statement.named_child(0)?;
    if assignment.kind() != "assignment" {
        return None;
    }
    let left = assignment.child_by_field_name("left")?;
    let annotation = assignment.child_by_field_name("type")?;
    if left.kind() != "identifier" {
        return None;
    }
    Some((
        node_text(&left, source).to_string(),
        node_text(&annotation, source).to_string(),
    ))
}

/// Maps module names to files under a project root and caches their parsed scopes.
#[derive(Debug)]
pub struct ProjectResolver {
    root: PathBuf,
    scopes: HashMap<String, Option<Arc<ModuleScope>>>,
}

impl ProjectResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scopes: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `a/b.py` or `a/b/__init__.py` under the project root.
    pub fn module_path(&self, module: &str) -> Option<PathBuf> {
        if module.is_empty() || module.split('.').any(|p| p.is_empty()) {
            return None;
        }
        let relative: PathBuf = module.split('.').collect();
        let file = self.root.join(&relative).with_extension("py");
        if file.is_file() {
            return Some(file);
        }
        let package = self.root.join(&relative).join("__init__.py");
        package.is_file().then_some(package)
    }

    /// Whether a module is defined by the project (as opposed to installed).
    pub fn is_project_module(&self, module: &str) -> bool {
        !is_free_module(module) && self.module_path(module).is_some()
    }

    /// Dotted module name for a file under the project root.
    pub fn module_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let file = parts.pop()?;
        let stem = file.strip_suffix(".py")?;
        if stem != "__init__" {
            parts.push(stem.to_string());
        }
        (!parts.is_empty()).then(|| parts.join("."))
    }

    /// Parsed scope of a project module, or `None` when the module is not part of the project.
    pub fn scope(&mut self, module: &str) -> Result<Option<Arc<ModuleScope>>> {
        if let Some(cached) = self.scopes.get(module) {
            return Ok(cached.clone());
        }
        let scope = if is_free_module(module) {
            None
        } else {
            match self.module_path(module) {
                Some(path) => {
                    let source = fs::read_to_string(&path).map_err(|e| {
                        CodespeakError::Extraction(format!(
                            "failed to read {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    Some(Arc::new(ModuleScope::parse(module, &path, source)?))
                }
                None => None,
            }
        };
        self.scopes.insert(module.to_string(), scope.clone());
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: &str = r#"from __future__ import annotations
import numpy as np
import os.path
from typing import TYPE_CHECKING, List
from .base import Entity as BaseEntity

if TYPE_CHECKING:
    from app.services import Service

UserId = int

class Point(BaseEntity, metaclass=Meta):
    """A point."""
    x: float
    y: float = 0.0
    label = "origin"

    def norm(self) -> float:
        return (self.x ** 2 + self.y ** 2) ** 0.5

    class Unit:
        scale: int

def helper(p: Point) -> Point:
    return p
"#;

    fn scope() -> ModuleScope {
        ModuleScope::parse(
            "app.models",
            Path::new("/project/app/models.py"),
            MODELS.to_string(),
        )
        .unwrap()
    }

    #[test]
    fn records_import_bindings() {
        let scope = scope();
        assert_eq!(scope.binding("np"), Some(&Binding::Module("numpy".into())));
        assert_eq!(scope.binding("os"), Some(&Binding::Module("os".into())));
        assert_eq!(
            scope.binding("List"),
            Some(&Binding::Symbol {
                module: "typing".into(),
                name: "List".into()
            })
        );
        assert_eq!(
            scope.binding("BaseEntity"),
            Some(&Binding::Symbol {
                module: "app.base".into(),
                name: "Entity".into()
            })
        );
        assert_eq!(
            scope.binding("Service"),
            Some(&Binding::Symbol {
                module: "app.services".into(),
                name: "Service".into()
            })
        );
    }

    #[test]
    fn records_classes_functions_and_assignments() {
        let scope = scope();
        let point = scope.class("Point").unwrap();
        assert_eq!(point.bases, vec!["BaseEntity".to_string()]);
        assert_eq!(
            point.attributes,
            vec![
                ("x".to_string(), "float".to_string()),
                ("y".to_string(), "float".to_string())
            ]
        );
        assert_eq!(point.methods.len(), 1);
        assert!(scope.class("Point.Unit").is_some());
        assert!(scope.defines_function("helper"));
        assert!(scope.defines_function("Point.norm"));
        assert!(scope.declares("Point.norm"));
        assert_eq!(scope.assignment("UserId"), Some("int"));
    }

    #[test]
    fn strips_a_method_from_class_source() {
        let scope = scope();
        let point = scope.class("Point").unwrap();
        let stripped = point.source_without_method("norm");
        assert!(!stripped.contains("def norm"));
        assert!(stripped.contains("x: float"));
        assert!(stripped.contains("class Unit"));
    }

    #[test]
    fn class_with_only_the_stripped_method_still_has_a_body() {
        let source = "class Counter:\n    def bump(self) -> int:\n        return 1\n";
        let scope =
            ModuleScope::parse("c", Path::new("/p/c.py"), source.to_string()).unwrap();
        let stripped = scope.class("Counter").unwrap().source_without_method("bump");
        assert_eq!(stripped, "class Counter:\n    pass");
    }

    #[test]
    fn resolves_relative_modules() {
        let module = scope();
        assert_eq!(module.resolve_relative(1, Some("base")), "app.base");
        assert_eq!(module.resolve_relative(2, None), "");

        let package = ModuleScope::parse(
            "app",
            Path::new("/project/app/__init__.py"),
            String::new(),
        )
        .unwrap();
        assert_eq!(package.resolve_relative(1, Some("models")), "app.models");
    }

    #[test]
    fn resolver_finds_project_modules() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app/sub")).unwrap();
        fs::write(dir.path().join("app/__init__.py"), "").unwrap();
        fs::write(dir.path().join("app/sub/mod.py"), "class A:\n    pass\n").unwrap();
        fs::write(dir.path().join("logging.py"), "").unwrap();

        let mut resolver = ProjectResolver::new(dir.path());
        assert!(resolver.is_project_module("app"));
        assert!(resolver.is_project_module("app.sub.mod"));
        assert!(!resolver.is_project_module("app.missing"));
        assert!(!resolver.is_project_module("logging"));
        assert!(!resolver.is_project_module("numpy"));

        let scope = resolver.scope("app.sub.mod").unwrap().unwrap();
        assert!(scope.class("A").is_some());
        assert!(resolver.scope("numpy").unwrap().is_none());

        assert_eq!(
            resolver.module_for_path(&dir.path().join("app/sub/mod.py")),
            Some("app.sub.mod".to_string())
        );
        assert_eq!(
            resolver.module_for_path(&dir.path().join("app/__init__.py")),
            Some("app".to_string())
        );
    }
}
