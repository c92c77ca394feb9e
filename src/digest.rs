//! Declaration fingerprints used as cache keys for generated artifacts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How strictly a recorded digest must match the active one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestPolicy {
    /// Declaration source only.
    #[default]
    Shallow,
    /// Declaration source plus the referenced custom types.
    Deep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationDigest {
    pub source_hash: String,
    pub deep_hash: String,
}

impl DeclarationDigest {
    pub fn compute(declaration_source: &str, custom_types_json: &str) -> Self {
        let source_hash = hex_sha256(declaration_source.as_bytes());
        let custom_types_hash = hex_sha256(custom_types_json.as_bytes());
        let deep_hash = hex_sha256(format!("{}{}", source_hash, custom_types_hash).as_bytes());
        Self {
            source_hash,
            deep_hash,
        }
    }

    pub fn matches(&self, other: &DeclarationDigest, policy: DigestPolicy) -> bool {
        match policy {
            DigestPolicy::Shallow => self.source_hash == other.source_hash,
            DigestPolicy::Deep => {
                self.source_hash == other.source_hash && self.deep_hash == other.deep_hash
            }
        }
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
