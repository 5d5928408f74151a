//! Commit graph and ref files supplied on the command line.

use anyhow::{Context, Result};
use lodestar_core::{CommitGraph, RefDescriptions};
use std::path::Path;

/// Read `git log --pretty='%H %P'` output.
pub async fn read_graph(path: &Path) -> Result<CommitGraph> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read commit graph {}", path.display()))?;
    parse_graph(&text).with_context(|| format!("invalid commit graph {}", path.display()))
}

fn parse_graph(text: &str) -> Result<CommitGraph> {
    Ok(CommitGraph::parse(text)?)
}

/// Read a JSON object of `commit -> [ref description]`. No file means no refs.
pub async fn read_refs(path: Option<&Path>) -> Result<RefDescriptions> {
    let Some(path) = path else {
        return Ok(RefDescriptions::new());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read refs {}", path.display()))?;
    parse_refs(&text).with_context(|| format!("invalid refs {}", path.display()))
}

fn parse_refs(text: &str) -> Result<RefDescriptions> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::RefType;

    #[test]
    fn test_parse_refs() {
        let refs = parse_refs(
            r#"{
                "c3": [
                    {"name": "main", "type": "branch", "is_default_branch": true},
                    {"name": "v1.0.0", "type": "tag", "created_date": "2024-05-01T00:00:00Z"}
                ]
            }"#,
        )
        .unwrap();

        let at_tip = &refs["c3"];
        assert_eq!(at_tip.len(), 2);
        assert!(at_tip[0].is_default_branch);
        assert!(at_tip[0].created_date.is_none());
        assert_eq!(at_tip[1].ref_type, RefType::Tag);
        assert!(!at_tip[1].is_default_branch);
        assert!(at_tip[1].created_date.is_some());
    }

    #[test]
    fn test_parse_refs_rejects_unknown_type() {
        assert!(parse_refs(r#"{"c1": [{"name": "x", "type": "note"}]}"#).is_err());
    }

    #[test]
    fn test_parse_graph_rejects_cycle() {
        assert!(parse_graph("a b\nb a\n").is_err());
        assert_eq!(parse_graph("c1\nc2 c1\n").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_refs_file_means_no_refs() {
        assert!(read_refs(None).await.unwrap().is_empty());

        let err = read_refs(Some(Path::new("/nonexistent/refs.json")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read refs"));
    }
}
