//! Artifact store: generated logic and its metadata, laid out to mirror the declaring module.
//!
//! ```text
//! <root>/<module/as/dirs>/<Qual___name>.py
//! <root>/<module/as/dirs>/metadata/metadata___<Qual___name>.json
//! ```
//!
//! Writes hold an exclusive advisory lock on `<root>/.lock` and go through a temp file and a
//! rename. Unreadable metadata is reported, not raised: the engine treats it as "no artifact".

pub mod cleanup;

use crate::config::Config;
use crate::digest::DeclarationDigest;
use crate::error::{CodespeakError, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;
pub const METADATA_DIR: &str = "metadata";
const METADATA_PREFIX: &str = "metadata___";
const QUALNAME_SEPARATOR: &str = "___";

/// Filesystem-safe name for a qualname: `Cart.total` becomes `Cart___total`.
pub fn system_name(qualname: &str) -> String {
    qualname.replace('.', QUALNAME_SEPARATOR)
}

pub fn qualname_from_system_name(name: &str) -> String {
    name.replace(QUALNAME_SEPARATOR, ".")
}

/// Last known state of a generated artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub declaration_digest: DeclarationDigest,
    pub declaration_source: String,
    pub require_execution: bool,
    pub did_execute: bool,
    pub has_tests: bool,
    pub did_pass_tests: bool,
    pub updated_at: DateTime<Utc>,
}

impl FunctionMetadata {
    /// Metadata for code that was just written and not yet validated.
    pub fn fresh(
        digest: DeclarationDigest,
        declaration_source: &str,
        require_execution: bool,
        has_tests: bool,
    ) -> Self {
        Self {
            declaration_digest: digest,
            declaration_source: declaration_source.to_string(),
            require_execution,
            did_execute: false,
            has_tests,
            did_pass_tests: false,
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataLoad {
    Missing,
    Loaded(FunctionMetadata),
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub logic: PathBuf,
    pub metadata: PathBuf,
    pub system_name: String,
}

struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.artifact_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, module: &str, qualname: &str) -> ArtifactPaths {
        let dir = module
            .split('.')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |dir, part| dir.join(part));
        let system_name = system_name(qualname);
        ArtifactPaths {
            logic: dir.join(format!("{}.py", system_name)),
            metadata: dir
                .join(METADATA_DIR)
                .join(format!("{}{}.json", METADATA_PREFIX, system_name)),
            dir,
            system_name,
        }
    }

    pub fn has_logic(&self, paths: &ArtifactPaths) -> bool {
        paths.logic.is_file()
    }

    pub fn read_logic(&self, paths: &ArtifactPaths) -> Result<String> {
        fs::read_to_string(&paths.logic).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CodespeakError::MissingArtifact(paths.logic.clone()),
            _ => CodespeakError::Io(e),
        })
    }

    pub fn write_logic(&self, paths: &ArtifactPaths, source: &str) -> Result<()> {
        let _lock = self.lock(true)?;
        self.ensure_package(&paths.dir)?;
        write_atomic(&paths.logic, source)
    }

    pub fn write_metadata(&self, paths: &ArtifactPaths, metadata: &FunctionMetadata) -> Result<()> {
        let _lock = self.lock(true)?;
        if let Some(parent) = paths.metadata.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&paths.metadata, &serde_json::to_string_pretty(metadata)?)
    }

    pub fn load_metadata(&self, paths: &ArtifactPaths) -> MetadataLoad {
        if !paths.metadata.is_file() {
            return MetadataLoad::Missing;
        }
        let _lock = match self.lock(false) {
            Ok(lock) => lock,
            Err(err) => return MetadataLoad::Corrupt(err.to_string()),
        };
        match fs::read_to_string(&paths.metadata) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(metadata) => MetadataLoad::Loaded(metadata),
                Err(err) => MetadataLoad::Corrupt(err.to_string()),
            },
            Err(err) if err.kind() == ErrorKind::NotFound => MetadataLoad::Missing,
            Err(err) => MetadataLoad::Corrupt(err.to_string()),
        }
    }

    /// Create `dir` and give it and every directory between it and the root an `__init__.py`.
    fn ensure_package(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut current = Some(dir);
        while let Some(path) = current {
            if !path.starts_with(&self.root) {
                break;
            }
            let init = path.join("__init__.py");
            if !init.exists() {
                fs::write(&init, "")?;
            }
            if path == self.root {
                break;
            }
            current = path.parent();
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock> {
        if exclusive {
            fs::create_dir_all(&self.root)?;
        } else if !self.root.exists() {
            return Err(CodespeakError::Store("artifact directory missing".to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => return Ok(StoreLock { file }),
                Err(err) if err.kind() != ErrorKind::WouldBlock => return Err(err.into()),
                Err(_) if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) => {
                    return Err(CodespeakError::Store(format!(
                        "timed out waiting for artifact lock ({}s)",
                        LOCK_TIMEOUT_SECS
                    )));
                }
                Err(_) => std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS)),
            }
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> DeclarationDigest {
        DeclarationDigest::compute("def add(a, b): ...", "{}")
    }

    #[test]
    fn paths_mirror_module_and_encode_qualname() {
        let store = ArtifactStore::new("/p/codespeak_inferred");
        let paths = store.paths("shop.api", "Cart.total");
        assert_eq!(paths.system_name, "Cart___total");
        assert_eq!(paths.logic, Path::new("/p/codespeak_inferred/shop/api/Cart___total.py"));
        assert_eq!(
            paths.metadata,
            Path::new("/p/codespeak_inferred/shop/api/metadata/metadata___Cart___total.json")
        );
        assert_eq!(qualname_from_system_name(&paths.system_name), "Cart.total");
    }

    #[test]
    fn writes_logic_as_importable_package() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("codespeak_inferred"));
        let paths = store.paths("shop.api", "add");
        assert!(!store.has_logic(&paths));
        assert!(matches!(store.read_logic(&paths), Err(CodespeakError::MissingArtifact(_))));

        store.write_logic(&paths, "def add(a, b):\n    return a + b\n").unwrap();
        assert!(store.has_logic(&paths));
        assert_eq!(store.read_logic(&paths).unwrap(), "def add(a, b):\n    return a + b\n");
        for package in ["", "shop", "shop/api"] {
            assert!(store.root().join(package).join("__init__.py").is_file());
        }
        assert!(!paths.logic.with_extension("tmp").exists());
    }

    #[test]
    fn metadata_round_trip_and_tolerant_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let paths = store.paths("app", "f");
        assert_eq!(store.load_metadata(&paths), MetadataLoad::Missing);

        let mut metadata = FunctionMetadata::fresh(digest(), "def f(): ...", true, false);
        assert!(!metadata.did_execute && !metadata.did_pass_tests);
        store.write_metadata(&paths, &metadata).unwrap();
        assert_eq!(store.load_metadata(&paths), MetadataLoad::Loaded(metadata.clone()));

        metadata.did_execute = true;
        metadata.touch();
        store.write_metadata(&paths, &metadata).unwrap();
        match store.load_metadata(&paths) {
            MetadataLoad::Loaded(loaded) => assert!(loaded.did_execute),
            other => panic!("unexpected {:?}", other),
        }

        fs::write(&paths.metadata, "{\"declaration_digest\": ").unwrap();
        assert!(matches!(store.load_metadata(&paths), MetadataLoad::Corrupt(_)));
    }

    #[test]
    fn metadata_json_uses_documented_keys() {
        let metadata = FunctionMetadata::fresh(digest(), "src", false, true);
        let value = serde_json::to_value(&metadata).unwrap();
        for key in [
            "declaration_digest",
            "declaration_source",
            "require_execution",
            "did_execute",
            "has_tests",
            "did_pass_tests",
            "updated_at",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert!(value["declaration_digest"]["source_hash"].is_string());
    }
}
