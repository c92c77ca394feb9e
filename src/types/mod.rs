//! Type descriptions for everything a declaration's signature references.
//!
//! A `TypeDefinition` is produced by the [`classify::Classifier`] from annotation text and
//! the module scopes it resolves through. Custom types (local and installed classes) are
//! rendered into the JSON context handed to the model; every other type only contributes
//! imports.

pub mod annotation;
pub mod classify;
pub mod scope;

pub use classify::Classifier;
pub use scope::{ModuleScope, ProjectResolver};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

pub const BUILTINS_MODULE: &str = "builtins";
const REFERENCE_PREFIX: &str = "$ref: complex_types/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypeDefinition {
    Builtin {
        qualname: String,
    },
    /// Typing constructs and builtin containers, with their type arguments.
    #[serde(rename = "GenericParametrized")]
    Generic {
        module: String,
        qualname: String,
        #[serde(default)]
        args: Vec<TypeDefinition>,
    },
    #[serde(rename = "UnionType")]
    Union { args: Vec<TypeDefinition> },
    LocalClass(LocalClass),
    /// A class from an installed package; the model is expected to know it already.
    InstalledClass { module: String, qualname: String },
    /// Stand-in for a custom type that is emitted elsewhere in the same context.
    #[serde(rename = "CustomTypeReference")]
    Reference { module: String, qualname: String },
    NoneType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalClass {
    pub module: String,
    pub qualname: String,
    pub source_code: String,
    pub bases: Vec<TypeDefinition>,
    pub attributes: BTreeMap<String, TypeDefinition>,
}

impl TypeDefinition {
    pub fn builtin(qualname: &str) -> Self {
        TypeDefinition::Builtin {
            qualname: qualname.to_string(),
        }
    }

    pub fn module(&self) -> &str {
        match self {
            TypeDefinition::Builtin { .. } | TypeDefinition::NoneType => BUILTINS_MODULE,
            TypeDefinition::Union { .. } => "types",
            TypeDefinition::Generic { module, .. }
            | TypeDefinition::InstalledClass { module, .. }
            | TypeDefinition::Reference { module, .. } => module,
            TypeDefinition::LocalClass(class) => &class.module,
        }
    }

    pub fn qualname(&self) -> &str {
        match self {
            TypeDefinition::NoneType => "None",
            TypeDefinition::Union { .. } => "UnionType",
            TypeDefinition::Builtin { qualname }
            | TypeDefinition::Generic { qualname, .. }
            | TypeDefinition::InstalledClass { qualname, .. }
            | TypeDefinition::Reference { qualname, .. } => qualname,
            TypeDefinition::LocalClass(class) => &class.qualname,
        }
    }

    pub fn import_path(&self) -> String {
        format!("{}.{}", self.module(), self.qualname())
    }

    /// Local and installed classes: the types described to the model.
    pub fn is_custom(&self) -> bool {
        matches!(
            self,
            TypeDefinition::LocalClass(_) | TypeDefinition::InstalledClass { .. }
        )
    }

    /// Every importable type in this graph, type arguments included.
    pub fn flatten(&self) -> Vec<TypeDefinition> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<TypeDefinition>) {
        match self {
            TypeDefinition::NoneType => {}
            TypeDefinition::Generic {
                module,
                qualname,
                args,
            } => {
                out.push(TypeDefinition::Generic {
                    module: module.clone(),
                    qualname: qualname.clone(),
                    args: Vec::new(),
                });
                for arg in args {
                    arg.flatten_into(out);
                }
            }
            TypeDefinition::Union { args } => {
                for arg in args {
                    arg.flatten_into(out);
                }
            }
            other => out.push(other.clone()),
        }
    }

    /// How this type appears inside a local class description.
    fn render_nested(&self) -> Value {
        match self {
            TypeDefinition::Builtin { qualname } => Value::String(qualname.clone()),
            TypeDefinition::NoneType => Value::String("None".to_string()),
            TypeDefinition::Generic { args, .. } if args.is_empty() => {
                Value::String(self.import_path())
            }
            TypeDefinition::Generic { args, .. } | TypeDefinition::Union { args } => {
                let mut map = Map::new();
                map.insert(
                    self.import_path(),
                    Value::Array(args.iter().map(TypeDefinition::render_nested).collect()),
                );
                Value::Object(map)
            }
            TypeDefinition::LocalClass(_)
            | TypeDefinition::InstalledClass { .. }
            | TypeDefinition::Reference { .. } => {
                Value::String(format!("{}{}", REFERENCE_PREFIX, self.import_path()))
            }
        }
    }
}

impl PartialEq for TypeDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.module() == other.module() && self.qualname() == other.qualname()
    }
}

impl Eq for TypeDefinition {}

impl Hash for TypeDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.module().hash(state);
        self.qualname().hash(state);
    }
}

impl LocalClass {
    /// Replace nested custom types in bases and attributes with references, returning the
    /// replaced definitions so the caller can emit them once at the top level.
    pub fn reference_nested_custom_types(&mut self) -> Vec<TypeDefinition> {
        let mut replaced = Vec::new();
        for base in &mut self.bases {
            swap_for_references(base, &mut replaced);
        }
        for attribute in self.attributes.values_mut() {
            swap_for_references(attribute, &mut replaced);
        }
        replaced
    }

    fn describe(&self) -> Value {
        let attributes: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(name, def)| (name.clone(), def.render_nested()))
            .collect();
        json!({
            "origin": "local",
            "module": self.module,
            "qualname": self.qualname,
            "source_code": self.source_code,
            "bases": self.bases.iter().map(TypeDefinition::render_nested).collect::<Vec<_>>(),
            "attribute_types_map": attributes,
        })
    }
}

fn swap_for_references(def: &mut TypeDefinition, replaced: &mut Vec<TypeDefinition>) {
    match def {
        TypeDefinition::LocalClass(_) | TypeDefinition::InstalledClass { .. } => {
            let reference = TypeDefinition::Reference {
                module: def.module().to_string(),
                qualname: def.qualname().to_string(),
            };
            replaced.push(std::mem::replace(def, reference));
        }
        TypeDefinition::Generic { args, .. } | TypeDefinition::Union { args } => {
            for arg in args {
                swap_for_references(arg, replaced);
            }
        }
        _ => {}
    }
}

/// Describe every custom type reachable from `defs`, keyed by import path.
///
/// Each class is described once: nested occurrences inside local classes are replaced by
/// `$ref` strings and the referenced class gets its own top-level entry.
pub fn collect_custom_types<'a, I>(defs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a TypeDefinition>,
{
    let mut out = Map::new();
    let mut references = Vec::new();
    let mut pending: Vec<TypeDefinition> = defs.into_iter().cloned().collect();
    pending.reverse();

    while let Some(def) = pending.pop() {
        let key = def.import_path();
        match def {
            TypeDefinition::Generic { args, .. } | TypeDefinition::Union { args } => {
                pending.extend(args.into_iter().rev());
            }
            TypeDefinition::InstalledClass { module, qualname } => {
                out.entry(key).or_insert_with(|| {
                    json!({"origin": "installed", "module": module, "qualname": qualname})
                });
            }
            TypeDefinition::LocalClass(mut class) => {
                if out.contains_key(&key) {
                    continue;
                }
                let replaced = class.reference_nested_custom_types();
                out.insert(key, class.describe());
                pending.extend(replaced.into_iter().rev());
            }
            TypeDefinition::Reference { module, qualname } => {
                references.push((key, module, qualname));
            }
            TypeDefinition::Builtin { .. } | TypeDefinition::NoneType => {}
        }
    }

    for (key, module, qualname) in references {
        out.entry(key)
            .or_insert_with(|| json!({"module": module, "qualname": qualname}));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(qualname: &str, attributes: Vec<(&str, TypeDefinition)>) -> TypeDefinition {
        TypeDefinition::LocalClass(LocalClass {
            module: "app.models".to_string(),
            qualname: qualname.to_string(),
            source_code: format!("class {}:\n    pass", qualname),
            bases: vec![TypeDefinition::builtin("object")],
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        })
    }

    fn list_of(def: TypeDefinition) -> TypeDefinition {
        TypeDefinition::Generic {
            module: "typing".to_string(),
            qualname: "List".to_string(),
            args: vec![def],
        }
    }

    #[test]
    fn identity_is_module_and_qualname() {
        let a = local("Point", vec![]);
        let b = local("Point", vec![("x", TypeDefinition::builtin("float"))]);
        assert_eq!(a, b);
        let set: std::collections::HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(
            TypeDefinition::builtin("int"),
            TypeDefinition::builtin("str")
        );
    }

    #[test]
    fn shared_local_class_is_emitted_once() {
        let point = local("Point", vec![("x", TypeDefinition::builtin("float"))]);
        let segment = local(
            "Segment",
            vec![("start", point.clone()), ("end", point.clone())],
        );
        let custom = collect_custom_types(&[point.clone(), list_of(segment)]);

        assert_eq!(custom.len(), 2);
        let point_entry = &custom["app.models.Point"];
        assert_eq!(point_entry["origin"], "local");
        assert_eq!(point_entry["attribute_types_map"]["x"], "float");

        let segment_entry = &custom["app.models.Segment"];
        assert_eq!(
            segment_entry["attribute_types_map"]["start"],
            "$ref: complex_types/app.models.Point"
        );
        assert_eq!(
            segment_entry["attribute_types_map"]["end"],
            "$ref: complex_types/app.models.Point"
        );
    }

    #[test]
    fn nested_classes_are_hoisted_out_of_generic_attributes() {
        let tag = TypeDefinition::InstalledClass {
            module: "enum".to_string(),
            qualname: "Enum".to_string(),
        };
        let item = local("Item", vec![]);
        let order = local(
            "Order",
            vec![("items", list_of(item)), ("tag", tag.clone())],
        );
        let custom = collect_custom_types(&[order]);

        assert_eq!(
            custom["app.models.Order"]["attribute_types_map"]["items"],
            json!({"typing.List": ["$ref: complex_types/app.models.Item"]})
        );
        assert!(custom.contains_key("app.models.Item"));
        assert_eq!(custom["enum.Enum"]["origin"], "installed");
    }

    #[test]
    fn builtins_and_typing_are_not_custom() {
        let defs = vec![
            TypeDefinition::builtin("int"),
            list_of(TypeDefinition::builtin("str")),
            TypeDefinition::NoneType,
        ];
        assert!(collect_custom_types(&defs).is_empty());
    }

    #[test]
    fn flatten_drops_args_from_generics() {
        let def = TypeDefinition::Union {
            args: vec![list_of(local("Point", vec![])), TypeDefinition::NoneType],
        };
        let flat = def.flatten();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].import_path(), "typing.List");
        assert!(matches!(&flat[0], TypeDefinition::Generic { args, .. } if args.is_empty()));
        assert_eq!(flat[1].import_path(), "app.models.Point");
    }

    #[test]
    fn serialises_with_type_tag() {
        let value = serde_json::to_value(TypeDefinition::NoneType).unwrap();
        assert_eq!(value, json!({"type": "NoneType"}));
        let value = serde_json::to_value(list_of(TypeDefinition::builtin("int"))).unwrap();
        assert_eq!(value["type"], "GenericParametrized");
        assert_eq!(value["args"][0]["type"], "Builtin");
    }
}
