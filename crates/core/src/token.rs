//! Visibility tokens.
//!
//! Two uploads with the same token shadow each other at a commit: only the
//! nearest one stays visible. The token is a SHA-256 over `root:indexer`, where
//! the indexer name is first folded into its family so that a SCIP indexer
//! shadows its LSIF predecessor.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Indexer names that do not follow the `lsif-<x>` / `scip-<x>` convention,
/// mapped to the family they belong to.
static INDEXER_FAMILIES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("lsif-node", "typescript"),
        ("lsif-tsc", "typescript"),
        ("lsif-typescript", "typescript"),
        ("scip-typescript", "typescript"),
        ("rust-analyzer", "rust"),
        ("lsif-rust", "rust"),
        ("scip-rust", "rust"),
        ("lsif-cpp", "clang"),
        ("lsif-clang", "clang"),
        ("scip-clang", "clang"),
        ("lsif-csharp", "dotnet"),
        ("lsif-dotnet", "dotnet"),
        ("scip-dotnet", "dotnet"),
    ])
});

const FAMILY_PREFIXES: [&str; 2] = ["lsif-", "scip-"];

/// Fold an indexer name into its family name.
///
/// Unknown names without a recognized prefix are returned unchanged.
pub fn indexer_family(indexer: &str) -> &str {
    if let Some(family) = INDEXER_FAMILIES.get(indexer) {
        return family;
    }
    FAMILY_PREFIXES
        .iter()
        .find_map(|prefix| indexer.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(indexer)
}

/// Shadowing identity of an upload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisibilityToken([u8; 32]);

impl VisibilityToken {
    /// Compute the token for an upload with the given root and indexer.
    pub fn new(root: &str, indexer: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(root.as_bytes());
        hasher.update(b":");
        hasher.update(indexer_family(indexer).as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for VisibilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VisibilityToken({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for VisibilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_families() {
        assert_eq!(indexer_family("lsif-go"), "go");
        assert_eq!(indexer_family("scip-go"), "go");
        assert_eq!(indexer_family("scip-lol"), "lol");
        assert_eq!(indexer_family("custom"), "custom");
        assert_eq!(indexer_family("scip-"), "scip-");
    }

    #[test]
    fn test_table_families() {
        assert_eq!(indexer_family("lsif-tsc"), "typescript");
        assert_eq!(indexer_family("scip-typescript"), "typescript");
        assert_eq!(indexer_family("rust-analyzer"), "rust");
    }

    #[test]
    fn test_scip_shadows_lsif() {
        assert_eq!(
            VisibilityToken::new("", "lsif-lol"),
            VisibilityToken::new("", "scip-lol")
        );
        assert_ne!(
            VisibilityToken::new("", "lsif-lol"),
            VisibilityToken::new("", "lsif-zzz")
        );
    }

    #[test]
    fn test_root_separates_tokens() {
        assert_ne!(
            VisibilityToken::new("a/", "idx"),
            VisibilityToken::new("b/", "idx")
        );
        assert_eq!(
            VisibilityToken::new("a/", "idx"),
            VisibilityToken::new("a/", "idx")
        );
    }

    #[test]
    fn test_hex_encoding() {
        let token = VisibilityToken::new("", "idx");
        assert_eq!(token.to_hex().len(), 64);
        assert_eq!(token.to_string(), token.to_hex());
    }
}
