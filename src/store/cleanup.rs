//! Removal of artifacts whose declaring function no longer exists.

use super::{qualname_from_system_name, ArtifactStore, METADATA_DIR};
use crate::error::Result;
use crate::syntax;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Answers "does `module` still define `qualname`" from the project's Python sources.
#[derive(Debug, Clone)]
pub struct SourceIndex {
    project_root: PathBuf,
}

impl SourceIndex {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn contains(&self, module: &str, qualname: &str) -> bool {
        let relative: PathBuf = module.split('.').collect();
        let candidates = [
            self.project_root.join(&relative).with_extension("py"),
            self.project_root.join(&relative).join("__init__.py"),
        ];
        let Some(source) = candidates.iter().find_map(|p| fs::read_to_string(p).ok()) else {
            return false;
        };
        match syntax::parse_python(&source) {
            Ok(tree) => syntax::find_definition(tree.root_node(), &source, qualname)
                .is_some_and(|def| !def.is_class()),
            Err(_) => false,
        }
    }
}

/// Delete every generated module under `root` whose function fails `exists`, with its
/// metadata, then prune directories left without artifacts. Returns the number removed.
pub fn remove_unused_artifacts(root: &Path, exists: &dyn Fn(&str, &str) -> bool) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }

    let mut stale = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        !(entry.file_type().is_dir() && (name == METADATA_DIR || name == "__pycache__"))
    });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "py") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem == "__init__" {
            continue;
        }
        let Some(module) = module_for(root, path) else {
            continue;
        };
        let qualname = qualname_from_system_name(stem);
        if !exists(&module, &qualname) {
            stale.push((path.to_path_buf(), module, qualname));
        }
    }

    let store = ArtifactStore::new(root);
    for (logic, module, qualname) in &stale {
        fs::remove_file(logic)?;
        let metadata = store.paths(module, qualname).metadata;
        if metadata.exists() {
            fs::remove_file(metadata)?;
        }
        tracing::info!(module = %module, qualname = %qualname, "removed unused artifact");
    }

    prune_empty_dirs(root)?;
    Ok(stale.len())
}

fn module_for(root: &Path, logic: &Path) -> Option<String> {
    let dir = logic.parent()?.strip_prefix(root).ok()?;
    let parts: Vec<String> = dir
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("."))
}

fn prune_empty_dirs(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() && holds_no_artifacts(entry.path())? {
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

fn holds_no_artifacts(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry.file_type()?;
        let ignorable = (file_type.is_file() && name == "__init__.py")
            || (file_type.is_dir() && name == "__pycache__");
        if !ignorable {
            return Ok(false);
        }
    }
    Ok(true)
}
