use super::annotation::{self, Annotation};
use super::scope::{Binding, ModuleScope, ProjectResolver};
use super::{swap_for_references, LocalClass, TypeDefinition, BUILTINS_MODULE};
use crate::error::{CodespeakError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Modules whose members are typing constructs rather than classes.
const TYPING_MODULES: &[&str] = &["typing", "typing_extensions", "collections.abc"];

/// Builtins that take type arguments (`list[int]`, `type[Foo]`).
const GENERIC_BUILTINS: &[&str] = &["list", "dict", "set", "tuple", "frozenset", "type"];

const BUILTIN_NAMES: &[&str] = &[
    "int", "float", "complex", "str", "bytes", "bytearray", "bool", "object", "range",
    "memoryview", "slice", "list", "dict", "set", "frozenset", "tuple", "type",
    "BaseException", "Exception", "ArithmeticError", "AssertionError", "AttributeError",
    "EOFError", "FileNotFoundError", "ImportError", "IndexError", "KeyError", "LookupError",
    "NotImplementedError", "OSError", "OverflowError", "PermissionError", "RuntimeError",
    "StopIteration", "TimeoutError", "TypeError", "UnicodeError", "ValueError",
    "ZeroDivisionError",
];

/// Limit on import and alias hops followed while resolving one name. Class nesting does not count.
const MAX_RESOLUTION_DEPTH: usize = 64;

type ClassKey = (String, String);

/// Turns annotation text into `TypeDefinition`s by resolving names through module scopes.
///
/// A local class is described in full the first time it is classified; later occurrences in
/// the same classifier are `Reference`s, which `collect_custom_types` resolves against the
/// full description.
pub struct Classifier<'r> {
    resolver: &'r mut ProjectResolver,
    in_progress: Vec<ClassKey>,
    /// Inheritable attributes of every class built so far, nested custom types as references.
    built: HashMap<ClassKey, BTreeMap<String, TypeDefinition>>,
    built_order: Vec<ClassKey>,
    depth: usize,
}

impl<'r> Classifier<'r> {
    pub fn new(resolver: &'r mut ProjectResolver) -> Self {
        Self {
            resolver,
            in_progress: Vec::new(),
            built: HashMap::new(),
            built_order: Vec::new(),
            depth: 0,
        }
    }

    /// Run `f`, forgetting classes it built if it fails: their full descriptions were dropped
    /// with the error, so later references to them would dangle.
    fn rollback_on_error<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mark = self.built_order.len();
        let result = f(self);
        if result.is_err() {
            for key in self.built_order.drain(mark..) {
                self.built.remove(&key);
            }
        }
        result
    }

    pub fn resolver(&mut self) -> &mut ProjectResolver {
        &mut *self.resolver
    }

    pub fn classify_text(&mut self, scope: &ModuleScope, text: &str) -> Result<TypeDefinition> {
        let parsed = annotation::parse(text)?;
        self.classify(scope, &parsed)
    }

    pub fn classify(&mut self, scope: &ModuleScope, annotation: &Annotation) -> Result<TypeDefinition> {
        self.rollback_on_error(|this| this.classify_annotation(scope, annotation))
    }

    fn classify_annotation(&mut self, scope: &ModuleScope, annotation: &Annotation) -> Result<TypeDefinition> {
        match annotation {
            Annotation::None => Ok(TypeDefinition::NoneType),
            Annotation::Name(dotted) => self.resolve_name(scope, dotted),
            Annotation::Str(text) => self.classify_text(scope, text),
            Annotation::Union(members) => Ok(TypeDefinition::Union {
                args: self.classify_args(scope, members)?,
            }),
            Annotation::Subscript { base, args } => {
                let origin = self.resolve_name(scope, base)?;
                self.parametrize(scope, origin, args)
            }
            Annotation::List(_) | Annotation::Ellipsis | Annotation::Literal(_) => {
                Err(CodespeakError::Classification(format!(
                    "{:?} is not a type on its own",
                    annotation
                )))
            }
        }
    }

    /// Classify the receiver class of a method, leaving the method itself out of its source.
    pub fn classify_self(
        &mut self,
        scope: &ModuleScope,
        class_qualname: &str,
        method: &str,
    ) -> Result<TypeDefinition> {
        let info = scope.class(class_qualname).ok_or_else(|| {
            CodespeakError::Classification(format!(
                "class {} not found in {}",
                class_qualname, scope.module
            ))
        })?;
        let stripped = info.source_without_method(method);
        let key = (scope.module.clone(), class_qualname.to_string());
        // Always a full description, even when the class was already built.
        self.in_progress.push(key);
        let result = self.rollback_on_error(|this| this.build_local_class(scope, class_qualname));
        self.in_progress.pop();
        match result? {
            TypeDefinition::LocalClass(mut class) => {
                class.source_code = stripped;
                Ok(TypeDefinition::LocalClass(class))
            }
            other => Ok(other),
        }
    }

    /// Classify `name` as imported from `module`.
    pub fn classify_symbol(&mut self, module: &str, name: &str) -> Result<TypeDefinition> {
        self.rollback_on_error(|this| this.resolve_symbol(module, name))
    }

    fn classify_args(&mut self, scope: &ModuleScope, args: &[Annotation]) -> Result<Vec<TypeDefinition>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Annotation::Ellipsis | Annotation::Literal(_) => {}
                Annotation::List(items) => out.extend(self.classify_args(scope, items)?),
                other => out.push(self.classify(scope, other)?),
            }
        }
        Ok(out)
    }

    fn parametrize(
        &mut self,
        scope: &ModuleScope,
        origin: TypeDefinition,
        args: &[Annotation],
    ) -> Result<TypeDefinition> {
        match origin {
            TypeDefinition::Generic {
                module, qualname, ..
            } => match qualname.clone().as_str() {
                "Literal" => Ok(TypeDefinition::Generic {
                    module,
                    qualname,
                    args: Vec::new(),
                }),
                "Union" => Ok(TypeDefinition::Union {
                    args: self.classify_args(scope, args)?,
                }),
                "Optional" => {
                    let mut members = self.classify_args(scope, args)?;
                    members.push(TypeDefinition::NoneType);
                    Ok(TypeDefinition::Union { args: members })
                }
                // Only the first argument of Annotated is a type.
                "Annotated" => {
                    let first = args.first().ok_or_else(|| {
                        CodespeakError::Classification("empty Annotated[]".to_string())
                    })?;
                    self.classify(scope, first)
                }
                _ => Ok(TypeDefinition::Generic {
                    args: self.classify_args(scope, args)?,
                    module,
                    qualname,
                }),
            },
            TypeDefinition::Builtin { qualname } => Err(CodespeakError::Classification(format!(
                "builtin {} does not take type arguments",
                qualname
            ))),
            // Parametrised user classes are described by their class alone.
            other => Ok(other),
        }
    }

    fn resolve_name(&mut self, scope: &ModuleScope, dotted: &str) -> Result<TypeDefinition> {
        if dotted == "None" {
            return Ok(TypeDefinition::NoneType);
        }
        self.depth += 1;
        let result = if self.depth > MAX_RESOLUTION_DEPTH {
            Err(CodespeakError::Classification(format!(
                "import cycle while resolving {} in {}",
                dotted, scope.module
            )))
        } else {
            self.resolve_name_inner(scope, dotted)
        };
        self.depth -= 1;
        result
    }

    fn resolve_name_inner(&mut self, scope: &ModuleScope, dotted: &str) -> Result<TypeDefinition> {
        let segments: Vec<&str> = dotted.split('.').collect();
        let head = segments[0];
        let rest = &segments[1..];

        if let Some(binding) = scope.binding(head).cloned() {
            return match binding {
                Binding::Module(module) => self.resolve_module_attribute(&module, rest, dotted),
                Binding::Symbol { module, name } => {
                    let mut qualname = name;
                    for segment in rest {
                        qualname.push('.');
                        qualname.push_str(segment);
                    }
                    self.resolve_symbol(&module, &qualname)
                }
            };
        }

        if scope.class(dotted).is_some() {
            return self.local_class(scope, dotted);
        }
        if scope.defines_function(dotted) || scope.defines_function(head) {
            return Err(CodespeakError::Classification(format!(
                "{} is a function; functions are not supported as types",
                dotted
            )));
        }
        if rest.is_empty() {
            if let Some(value) = scope.assignment(head) {
                return self.resolve_alias(scope, head, value);
            }
            if BUILTIN_NAMES.contains(&head) {
                return Ok(builtin(head));
            }
        }
        Err(CodespeakError::Classification(format!(
            "cannot resolve `{}` in module {}",
            dotted, scope.module
        )))
    }

    /// `np.ndarray`, `typing.List`, `app.models.Point` reached through a module binding.
    fn resolve_module_attribute(
        &mut self,
        module: &str,
        rest: &[&str],
        dotted: &str,
    ) -> Result<TypeDefinition> {
        if rest.is_empty() {
            return Err(CodespeakError::Classification(format!(
                "module {} used as a type",
                dotted
            )));
        }
        for split in (0..rest.len()).rev() {
            let candidate = join_module(module, &rest[..split]);
            if self.resolver.is_project_module(&candidate) {
                return self.resolve_symbol(&candidate, &rest[split..].join("."));
            }
        }
        let owner = join_module(module, &rest[..rest.len() - 1]);
        self.resolve_symbol(&owner, rest[rest.len() - 1])
    }

    fn resolve_symbol(&mut self, module: &str, qualname: &str) -> Result<TypeDefinition> {
        if TYPING_MODULES.contains(&module) {
            return Ok(TypeDefinition::Generic {
                module: module.to_string(),
                qualname: qualname.to_string(),
                args: Vec::new(),
            });
        }
        if module == BUILTINS_MODULE {
            return if BUILTIN_NAMES.contains(&qualname) {
                Ok(builtin(qualname))
            } else {
                Err(CodespeakError::Classification(format!(
                    "unknown builtin {}",
                    qualname
                )))
            };
        }
        match self.resolver.scope(module)? {
            Some(scope) => self.resolve_in_project_module(scope, qualname),
            None => Ok(TypeDefinition::InstalledClass {
                module: module.to_string(),
                qualname: qualname.to_string(),
            }),
        }
    }

    fn resolve_in_project_module(&mut self, scope: Arc<ModuleScope>, qualname: &str) -> Result<TypeDefinition> {
        self.resolve_name(&scope, qualname)
    }

    /// Module-level assignments used as types: aliases, `TypeVar`s and `NewType`s.
    fn resolve_alias(&mut self, scope: &ModuleScope, name: &str, value: &str) -> Result<TypeDefinition> {
        let value = value.trim();
        for construct in ["TypeVar", "ParamSpec", "TypeVarTuple"] {
            if value.starts_with(&format!("{}(", construct))
                || value.starts_with(&format!("typing.{}(", construct))
            {
                return Ok(TypeDefinition::Generic {
                    module: "typing".to_string(),
                    qualname: construct.to_string(),
                    args: Vec::new(),
                });
            }
        }
        if let Some(inner) = value
            .strip_prefix("NewType(")
            .or_else(|| value.strip_prefix("typing.NewType("))
            .and_then(|v| v.strip_suffix(')'))
        {
            let base = inner.split_once(',').map(|(_, b)| b.trim()).unwrap_or("");
            return self.classify_text(scope, base);
        }
        self.classify_text(scope, value).map_err(|e| {
            CodespeakError::Classification(format!(
                "`{}` in {} is not a usable type alias ({})",
                name, scope.module, e
            ))
        })
    }

    fn local_class(&mut self, scope: &ModuleScope, qualname: &str) -> Result<TypeDefinition> {
        let key = (scope.module.clone(), qualname.to_string());
        if self.in_progress.contains(&key) || self.built.contains_key(&key) {
            return Ok(TypeDefinition::Reference {
                module: key.0,
                qualname: key.1,
            });
        }
        self.in_progress.push(key.clone());
        // Each class body starts a fresh hop count.
        let depth = std::mem::take(&mut self.depth);
        let result = self.build_local_class(scope, qualname);
        self.depth = depth;
        self.in_progress.pop();

        if let Ok(TypeDefinition::LocalClass(class)) = &result {
            self.built.insert(key.clone(), inheritable(&class.attributes));
            self.built_order.push(key);
        }
        result
    }

    fn build_local_class(&mut self, scope: &ModuleScope, qualname: &str) -> Result<TypeDefinition> {
        let info = scope
            .class(qualname)
            .cloned()
            .ok_or_else(|| CodespeakError::Classification(format!("class {} not found", qualname)))?;

        let mut bases = Vec::with_capacity(info.bases.len().max(1));
        let mut attributes = BTreeMap::new();
        for base_text in &info.bases {
            let base = self.classify_text(scope, base_text)?;
            // Annotations are inherited, as with typing.get_type_hints.
            let inherited = match &base {
                TypeDefinition::LocalClass(parent) => Some(inheritable(&parent.attributes)),
                TypeDefinition::Reference { module, qualname } => self
                    .built
                    .get(&(module.clone(), qualname.clone()))
                    .cloned(),
                _ => None,
            };
            attributes.extend(inherited.into_iter().flatten());
            bases.push(base);
        }
        if bases.is_empty() {
            bases.push(builtin("object"));
        }
        for (name, text) in &info.attributes {
            attributes.insert(name.clone(), self.classify_text(scope, text)?);
        }

        Ok(TypeDefinition::LocalClass(LocalClass {
            module: scope.module.clone(),
            qualname: qualname.to_string(),
            source_code: info.source,
            bases,
            attributes,
        }))
    }
}

/// Attributes with nested custom types swapped for references; the originals are described
/// where the owning class first appeared.
fn inheritable(attributes: &BTreeMap<String, TypeDefinition>) -> BTreeMap<String, TypeDefinition> {
    let mut attributes = attributes.clone();
    let mut replaced = Vec::new();
    for def in attributes.values_mut() {
        swap_for_references(def, &mut replaced);
    }
    attributes
}

fn builtin(name: &str) -> TypeDefinition {
    if GENERIC_BUILTINS.contains(&name) {
        TypeDefinition::Generic {
            module: BUILTINS_MODULE.to_string(),
            qualname: name.to_string(),
            args: Vec::new(),
        }
    } else {
        TypeDefinition::builtin(name)
    }
}

fn join_module(module: &str, parts: &[&str]) -> String {
    let mut joined = module.to_string();
    for part in parts {
        joined.push('.');
        joined.push_str(part);
    }
    joined
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
        write(dir.path(), "app/__init__.py", "");
        write(
            dir.path(),
            "app/base.py",
            "class Entity:\n    id: int\n",
        );
        write(
            dir.path(),
            "app/models.py",
            r#"from dataclasses import dataclass
from typing import List, Optional, TypeVar
import numpy as np
import app.base
from .base import Entity

T = TypeVar("T")
Meters = float

@dataclass
class Point(Entity):
    x: Meters
    y: float

class Node:
    value: int
    next: "Node | None"

class Segment:
    start: Point
    end: Point
    tags: List[str]

def helper() -> None:
    pass
"#,
        );
        dir
    }

    fn classify(dir: &Path, text: &str) -> Result<TypeDefinition> {
        let mut resolver = ProjectResolver::new(dir);
        let scope = resolver.scope("app.models").unwrap().unwrap();
        Classifier::new(&mut resolver).classify_text(&scope, text)
    }

    #[test]
    fn builtins_and_generic_builtins() {
        let dir = project();
        assert!(matches!(
            classify(dir.path(), "int").unwrap(),
            TypeDefinition::Builtin { ref qualname } if qualname == "int"
        ));
        let listed = classify(dir.path(), "list[int]").unwrap();
        assert_eq!(listed.import_path(), "builtins.list");
        assert!(matches!(listed, TypeDefinition::Generic { ref args, .. } if args.len() == 1));
        assert!(classify(dir.path(), "int[str]").is_err());
    }

    #[test]
    fn typing_constructs_and_unions() {
        let dir = project();
        let optional = classify(dir.path(), "Optional[int]").unwrap();
        let TypeDefinition::Union { args } = optional else {
            panic!("expected union");
        };
        assert_eq!(args.len(), 2);
        assert!(matches!(args[1], TypeDefinition::NoneType));

        let pep604 = classify(dir.path(), "int | str").unwrap();
        assert!(matches!(pep604, TypeDefinition::Union { ref args } if args.len() == 2));

        let listed = classify(dir.path(), "List[Point]").unwrap();
        assert_eq!(listed.import_path(), "typing.List");
    }

    #[test]
    fn local_class_captures_source_bases_and_hints() {
        let dir = project();
        let TypeDefinition::LocalClass(point) = classify(dir.path(), "Point").unwrap() else {
            panic!("expected local class");
        };
        assert_eq!(point.module, "app.models");
        assert!(point.source_code.starts_with("@dataclass\nclass Point(Entity):"));
        assert_eq!(point.bases.len(), 1);
        assert_eq!(point.bases[0].import_path(), "app.base.Entity");
        // `Meters` is an alias for float; `id` is inherited from Entity.
        assert_eq!(point.attributes["x"].import_path(), "builtins.float");
        assert_eq!(point.attributes["id"].import_path(), "builtins.int");
    }

    #[test]
    fn self_referential_class_uses_reference() {
        let dir = project();
        let TypeDefinition::LocalClass(node) = classify(dir.path(), "Node").unwrap() else {
            panic!("expected local class");
        };
        let TypeDefinition::Union { args } = &node.attributes["next"] else {
            panic!("expected union");
        };
        assert!(matches!(args[0], TypeDefinition::Reference { .. }));
        assert_eq!(node.bases[0].import_path(), "builtins.object");
    }

    #[test]
    fn installed_and_module_qualified_types() {
        let dir = project();
        let array = classify(dir.path(), "np.ndarray").unwrap();
        assert!(matches!(array, TypeDefinition::InstalledClass { .. }));
        assert_eq!(array.import_path(), "numpy.ndarray");

        let dataclass_field = classify(dir.path(), "dataclass").unwrap();
        assert_eq!(dataclass_field.import_path(), "dataclasses.dataclass");

        let qualified = classify(dir.path(), "app.base.Entity").unwrap();
        assert!(matches!(qualified, TypeDefinition::LocalClass(_)));
    }

    #[test]
    fn rejects_functions_and_unknown_names() {
        let dir = project();
        let err = classify(dir.path(), "helper").unwrap_err();
        assert!(err.to_string().contains("function"));
        assert!(classify(dir.path(), "Missing").is_err());
    }

    #[test]
    fn type_vars_are_typing_constructs() {
        let dir = project();
        assert_eq!(classify(dir.path(), "T").unwrap().import_path(), "typing.TypeVar");
    }

    /// `Model{i}` refers to `Model{i-1}` once, or twice (`parent` and `siblings`) when `fan_out`.
    fn chain_project(levels: usize, fan_out: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut models = String::from("from typing import List, Optional\n\n");
        for i in 0..levels {
            models.push_str(&format!("class Model{}:\n    name: str\n", i));
            if i > 0 {
                models.push_str(&format!("    parent: Optional[Model{}]\n", i - 1));
                if fan_out {
                    models.push_str(&format!("    siblings: List[Model{}]\n", i - 1));
                }
            }
            models.push('\n');
        }
        write(dir.path(), "models.py", &models);
        dir
    }

    fn classify_in(dir: &Path, module: &str, text: &str) -> Result<TypeDefinition> {
        let mut resolver = ProjectResolver::new(dir);
        let scope = resolver.scope(module).unwrap().unwrap();
        Classifier::new(&mut resolver).classify_text(&scope, text)
    }

    #[test]
    fn shared_classes_are_built_once() {
        let dir = chain_project(40, true);
        let started = std::time::Instant::now();
        let def = classify_in(dir.path(), "models", "Model39").unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        let custom = crate::types::collect_custom_types([&def]);
        assert_eq!(custom.len(), 40);
        for i in 0..40 {
            assert_eq!(custom[&format!("models.Model{}", i)]["origin"], "local");
        }
        assert_eq!(
            custom["models.Model39"]["attribute_types_map"]["siblings"],
            serde_json::json!({"typing.List": ["$ref: complex_types/models.Model38"]})
        );
    }

    #[test]
    fn deep_acyclic_chain_resolves() {
        let dir = chain_project(70, false);
        let def = classify_in(dir.path(), "models", "Model69").unwrap();
        let custom = crate::types::collect_custom_types([&def]);
        assert_eq!(custom.len(), 70);
        assert!(custom.contains_key("models.Model0"));
    }

    #[test]
    fn import_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "from b import Thing\n");
        write(dir.path(), "b.py", "from a import Thing\n");
        let err = classify_in(dir.path(), "a", "Thing").unwrap_err();
        assert!(err.to_string().contains("import cycle"));
    }

    #[test]
    fn repeated_class_is_a_reference() {
        let dir = project();
        let TypeDefinition::LocalClass(segment) = classify(dir.path(), "Segment").unwrap() else {
            panic!("expected local class");
        };
        assert!(matches!(segment.attributes["start"], TypeDefinition::LocalClass(_)));
        assert!(matches!(
            segment.attributes["end"],
            TypeDefinition::Reference { ref qualname, .. } if qualname == "Point"
        ));
    }

    #[test]
    fn failed_classification_forgets_its_classes() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let scope = resolver.scope("app.models").unwrap().unwrap();
        let mut classifier = Classifier::new(&mut resolver);

        assert!(classifier.classify_text(&scope, "Point | Missing").is_err());
        let point = classifier.classify_text(&scope, "Point").unwrap();
        assert!(matches!(point, TypeDefinition::LocalClass(_)));
        let again = classifier.classify_text(&scope, "Point").unwrap();
        assert!(matches!(again, TypeDefinition::Reference { .. }));
    }

    #[test]
    fn inherited_attributes_survive_a_built_base() {
        let dir = project();
        let mut resolver = ProjectResolver::new(dir.path());
        let scope = resolver.scope("app.models").unwrap().unwrap();
        let mut classifier = Classifier::new(&mut resolver);

        classifier.classify_text(&scope, "Entity").unwrap();
        let TypeDefinition::LocalClass(point) = classifier.classify_text(&scope, "Point").unwrap()
        else {
            panic!("expected local class");
        };
        assert!(matches!(point.bases[0], TypeDefinition::Reference { .. }));
        assert_eq!(point.attributes["id"].import_path(), "builtins.int");
    }

    #[test]
    fn classify_self_strips_method() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "shop.py",
            "class Cart:\n    total: int\n\n    def add(self, n: int) -> int:\n        \"\"\"add n\"\"\"\n\n    def clear(self) -> None:\n        pass\n",
        );
        let mut resolver = ProjectResolver::new(dir.path());
        let scope = resolver.scope("shop").unwrap().unwrap();
        let def = Classifier::new(&mut resolver)
            .classify_self(&scope, "Cart", "add")
            .unwrap();
        let TypeDefinition::LocalClass(cart) = def else {
            panic!("expected local class");
        };
        assert!(!cart.source_code.contains("def add"));
        assert!(cart.source_code.contains("def clear"));
        assert_eq!(cart.attributes["total"].import_path(), "builtins.int");
    }
}
