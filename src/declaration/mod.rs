//! Declaration extraction: everything the model is told about a function.
//!
//! A [`FunctionDeclaration`] is derived from the Python source of the function's module. The
//! body is never shown to the model; it receives an "incomplete file" made of the imports the
//! signature needs and the bare header, plus a JSON description of every custom type the
//! signature reaches.

pub mod context;
pub mod signature;
pub mod test_function;

pub use signature::{BodyImports, FunctionHeader, SignatureBindings};
pub use test_function::TestFunction;

use crate::digest::DeclarationDigest;
use crate::error::{CodespeakError, Result};
use crate::syntax::{self, find_definition};
use crate::types::{collect_custom_types, Classifier, ProjectResolver, TypeDefinition, BUILTINS_MODULE};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct FunctionDeclaration {
    pub name: String,
    pub qualname: String,
    pub module: String,
    pub path: PathBuf,
    pub docstring: Option<String>,
    /// Dedented function source, decorators included.
    pub source: String,
    /// Rebuilt header, `def name(params) -> ret:`.
    pub signature: String,
    /// Enclosing class qualname for methods.
    pub owner_class: Option<String>,
    /// Method whose first parameter is `self`.
    pub takes_self: bool,
    pub signature_types: Vec<TypeDefinition>,
    pub self_definition: Option<TypeDefinition>,
    pub body_imports: BodyImports,
    bindings: SignatureBindings,
    imports: BTreeMap<String, BTreeSet<String>>,
}

impl FunctionDeclaration {
    pub fn extract(resolver: &mut ProjectResolver, module: &str, qualname: &str) -> Result<Self> {
        let scope = resolver.scope(module)?.ok_or_else(|| {
            CodespeakError::Extraction(format!(
                "module {} is not part of the project at {}",
                module,
                resolver.root().display()
            ))
        })?;
        let source = scope.source.as_str();
        let tree = syntax::parse_python(source)?;
        let def = find_definition(tree.root_node(), source, qualname)
            .filter(|d| !d.is_class())
            .ok_or_else(|| {
                CodespeakError::Extraction(format!("function {} not found in {}", qualname, module))
            })?;

        let header = FunctionHeader::from_definition(&def, source)?;
        let signature = header.render();
        signature::validate(&signature)?;

        let owner_class = qualname
            .rsplit_once('.')
            .map(|(parent, _)| parent)
            .filter(|parent| scope.class(parent).is_some())
            .map(str::to_string);
        let takes_self = owner_class.is_some()
            && header
                .first_parameter()
                .is_some_and(|p| p.name == "self" && p.annotation.is_none() && !p.text.starts_with('*'));

        let mut classifier = Classifier::new(resolver);
        let mut signature_types = Vec::new();
        for annotation in header.annotations() {
            signature_types.push(classifier.classify_text(&scope, annotation)?);
        }
        let body_imports = BodyImports::collect(&def, &scope, &mut classifier)?;
        let bindings = signature::signature_bindings(&header, &scope);

        let mut declaration = Self {
            name: header.name.clone(),
            qualname: qualname.to_string(),
            module: module.to_string(),
            path: scope.path.clone(),
            docstring: syntax::docstring(&def, source),
            source: def.source(source),
            signature,
            owner_class,
            takes_self,
            signature_types,
            self_definition: None,
            body_imports,
            bindings,
            imports: BTreeMap::new(),
        };
        declaration.regroup_imports();
        Ok(declaration)
    }

    /// Late-bind the receiver class of a method and annotate `self` with it.
    ///
    /// Returns whether anything changed; binding twice is a no-op.
    pub fn bind_self_type(&mut self, resolver: &mut ProjectResolver) -> Result<bool> {
        if self.self_definition.is_some() || !self.takes_self {
            return Ok(false);
        }
        let Some(class) = self.owner_class.clone() else {
            return Ok(false);
        };
        let scope = resolver.scope(&self.module)?.ok_or_else(|| {
            CodespeakError::Extraction(format!("module {} disappeared", self.module))
        })?;
        let definition = Classifier::new(resolver).classify_self(&scope, &class, &self.name)?;

        self.signature = signature::insert_self_type(&self.signature, &class);
        self.self_definition = Some(definition);
        self.regroup_imports();
        tracing::debug!(qualname = %self.qualname, class = %class, "bound self type");
        Ok(true)
    }

    fn regroup_imports(&mut self) {
        let mut imports: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let all = self.self_definition.iter().chain(&self.signature_types);
        for def in all.flat_map(TypeDefinition::flatten) {
            let module = def.module();
            if module == BUILTINS_MODULE {
                continue;
            }
            let qualname = def.qualname();
            let head = qualname.split('.').next().unwrap_or(qualname);
            imports
                .entry(module.to_string())
                .or_default()
                .insert(head.to_string());
        }
        for (module, name) in &self.bindings.symbols {
            imports.entry(module.clone()).or_default().insert(name.clone());
        }
        self.imports = imports;
    }

    /// `from m import a, b` groups for every non-builtin type and plain name in the signature.
    pub fn imports(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.imports
    }

    pub fn imports_text(&self) -> String {
        let mut text = String::new();
        for (module, names) in &self.imports {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            text.push_str(&format!("from {} import {}\n", module, names.join(", ")));
        }
        for line in &self.bindings.lines {
            text.push_str(line);
            text.push('\n');
        }
        for statement in &self.body_imports.statements {
            text.push_str(statement);
            text.push('\n');
        }
        text.push_str(&context::sentinel_import());
        text
    }

    /// Imports followed by the bare header; what the model is asked to complete.
    pub fn as_incomplete_file(&self) -> String {
        format!("{}\n{}\n", self.imports_text(), self.signature)
    }

    /// Descriptions of every custom type the declaration reaches, plus the runtime helpers.
    pub fn custom_types(&self) -> Value {
        let defs = self
            .self_definition
            .iter()
            .chain(&self.signature_types)
            .chain(&self.body_imports.types);
        let mut types = collect_custom_types(defs);
        context::add_runtime_types(&mut types);
        let mut wrapper = Map::new();
        wrapper.insert("custom_types".to_string(), Value::Object(types));
        Value::Object(wrapper)
    }

    pub fn custom_types_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.custom_types())?)
    }

    pub fn digest(&self) -> Result<DeclarationDigest> {
        Ok(DeclarationDigest::compute(&self.source, &self.custom_types_json()?))
    }

    pub fn goal(&self) -> &str {
        self.docstring.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "shop/__init__.py", "");
        write(
            dir.path(),
            "shop/models.py",
            "class Item:\n    name: str\n    price: float\n\nclass Order:\n    items: list[Item]\n    note: str | None\n",
        );
        write(
            dir.path(),
            "shop/api.py",
            r#"from typing import List, Optional
import numpy as np
from .models import Item, Order

def add(a: int, b: int) -> int:
    """adds two numbers"""

def totals(orders: List[Order], scale: np.ndarray) -> Optional[float]:
    """
    Sum the prices of every item in every order.
    """
    from shop.models import Item
    return None

class Cart:
    owner: str
    items: List[Item]

    def total(self, tax: float = 0.2) -> float:
        """Total price with tax."""

    def bad(self):
        import os
"#,
        );
        dir
    }

    #[test]
    fn extracts_plain_function() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let decl = FunctionDeclaration::extract(&mut resolver, "shop.api", "add").unwrap();
        assert_eq!(decl.name, "add");
        assert_eq!(decl.signature, "def add(a: int, b: int) -> int:");
        assert_eq!(decl.goal(), "adds two numbers");
        assert!(decl.owner_class.is_none());
        assert!(decl.imports().is_empty());
        assert_eq!(
            decl.as_incomplete_file(),
            "from codespeak import InferredException\n\ndef add(a: int, b: int) -> int:\n"
        );
        // Only the runtime helpers are described.
        assert_eq!(decl.custom_types()["custom_types"].as_object().unwrap().len(), 5);
    }

    #[test]
    fn groups_imports_and_describes_custom_types() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let decl = FunctionDeclaration::extract(&mut resolver, "shop.api", "totals").unwrap();

        let imports = decl.imports();
        assert_eq!(
            imports["typing"].iter().collect::<Vec<_>>(),
            vec!["List", "Optional"]
        );
        assert!(imports["shop.models"].contains("Order"));
        assert!(imports["numpy"].contains("ndarray"));

        let file = decl.as_incomplete_file();
        assert!(file.contains("import numpy as np\n"));
        assert!(file.contains("from shop.models import Item\n"));
        assert!(file.ends_with(
            "from codespeak import InferredException\n\ndef totals(orders: List[Order], scale: np.ndarray) -> Optional[float]:\n"
        ));
        assert!(!file.contains("return None"));

        let types = decl.custom_types();
        let types = types["custom_types"].as_object().unwrap();
        assert_eq!(types["shop.models.Order"]["origin"], "local");
        assert_eq!(types["shop.models.Item"]["origin"], "local");
        assert_eq!(types["numpy.ndarray"]["origin"], "installed");
        assert_eq!(
            types["shop.models.Order"]["attribute_types_map"]["items"],
            serde_json::json!({"builtins.list": ["$ref: complex_types/shop.models.Item"]})
        );
    }

    #[test]
    fn binds_self_type_once() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let mut decl = FunctionDeclaration::extract(&mut resolver, "shop.api", "Cart.total").unwrap();
        assert!(decl.takes_self);
        assert_eq!(decl.owner_class.as_deref(), Some("Cart"));
        let before = decl.digest().unwrap();

        assert!(decl.bind_self_type(&mut resolver).unwrap());
        assert_eq!(decl.signature, "def total(self: Cart, tax: float = 0.2) -> float:");
        assert!(decl.imports()["shop.api"].contains("Cart"));
        let types = decl.custom_types();
        let cart = &types["custom_types"]["shop.api.Cart"];
        assert!(!cart["source_code"].as_str().unwrap().contains("def total"));

        assert!(!decl.bind_self_type(&mut resolver).unwrap());
        let after = decl.digest().unwrap();
        assert_eq!(before.source_hash, after.source_hash);
        assert_ne!(before.deep_hash, after.deep_hash);
    }

    #[test]
    fn whole_module_body_imports_are_rejected() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let err = FunctionDeclaration::extract(&mut resolver, "shop.api", "Cart.bad").unwrap_err();
        assert!(err.to_string().contains("import os"));
    }

    #[test]
    fn missing_function_and_module() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        assert!(FunctionDeclaration::extract(&mut resolver, "shop.api", "nope").is_err());
        assert!(FunctionDeclaration::extract(&mut resolver, "shop.api", "Cart").is_err());
        assert!(FunctionDeclaration::extract(&mut resolver, "shop.missing", "add").is_err());
    }

    #[test]
    fn digest_tracks_referenced_class_shape() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let first = FunctionDeclaration::extract(&mut resolver, "shop.api", "totals")
            .unwrap()
            .digest()
            .unwrap();

        write(
            dir.path(),
            "shop/models.py",
            "class Item:\n    name: str\n    price: int\n\nclass Order:\n    items: list[Item]\n    note: str | None\n",
        );
        let mut resolver = ProjectResolver::new(dir.path());
        let second = FunctionDeclaration::extract(&mut resolver, "shop.api", "totals")
            .unwrap()
            .digest()
            .unwrap();
        assert_eq!(first.source_hash, second.source_hash);
        assert_ne!(first.deep_hash, second.deep_hash);
    }
}
