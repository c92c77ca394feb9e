use crate::error::{CodespeakError, Result};
use crate::syntax::{self, find_definition};
use std::fs;
use std::path::{Path, PathBuf};

/// A pytest test attached to a managed function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFunction {
    pub file: PathBuf,
    /// Dotted qualname, `TestCart.test_total` for methods of test classes.
    pub qualname: String,
    pub source: String,
}

impl TestFunction {
    pub fn extract(file: &Path, qualname: &str) -> Result<Self> {
        let source = fs::read_to_string(file).map_err(|e| {
            CodespeakError::Extraction(format!("failed to read test file {}: {}", file.display(), e))
        })?;
        let tree = syntax::parse_python(&source)?;
        let def = find_definition(tree.root_node(), &source, qualname)
            .filter(|d| !d.is_class())
            .ok_or_else(|| {
                CodespeakError::Extraction(format!(
                    "test {} not found in {}",
                    qualname,
                    file.display()
                ))
            })?;
        Ok(Self {
            file: file.to_path_buf(),
            qualname: qualname.to_string(),
            source: def.source(&source),
        })
    }

    /// Parse a `path/to/test_file.py::TestClass::test_name` target relative to `root`.
    pub fn from_target(root: &Path, target: &str) -> Result<Self> {
        let (file, qualname) = parse_target(target)?;
        let file = if file.is_absolute() { file } else { root.join(file) };
        Self::extract(&file, &qualname)
    }

    /// pytest node id selecting exactly this test.
    pub fn node_id(&self) -> String {
        format!("{}::{}", self.file.display(), self.qualname.replace('.', "::"))
    }
}

pub fn parse_target(target: &str) -> Result<(PathBuf, String)> {
    let mut parts = target.split("::");
    let file = parts.next().filter(|f| f.ends_with(".py"));
    let names: Vec<&str> = parts.collect();
    match file {
        Some(file) if !names.is_empty() && names.iter().all(|n| !n.is_empty()) => {
            Ok((PathBuf::from(file), names.join(".")))
        }
        _ => Err(CodespeakError::Extraction(format!(
            "invalid test target `{}`, expected FILE.py::NAME",
            target
        ))),
    }
}
