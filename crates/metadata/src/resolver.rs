//! Backend-independent parts of closest-upload resolution.

use crate::models::{ClosestUploadQuery, DumpRow};
use lodestar_core::{CommitGraphView, UploadId, UploadMeta, root_covers_path};
use std::collections::{BTreeSet, HashMap};

/// Upload IDs mentioned by a set of persisted visibility lists.
pub(crate) fn upload_ids(visible: &[(String, Vec<UploadMeta>)]) -> Vec<i64> {
    visible
        .iter()
        .flat_map(|(_, uploads)| uploads.iter().map(|meta| meta.upload_id.get()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Seed a view with what the tables already know about fragment commits.
/// Uploads without a catalog row are skipped.
pub(crate) fn fragment_view(
    visible: Vec<(String, Vec<UploadMeta>)>,
    identities: &HashMap<i64, (String, String)>,
) -> CommitGraphView {
    let mut view = CommitGraphView::new();
    for (commit, uploads) in visible {
        for meta in uploads {
            let Some((root, indexer)) = identities.get(&meta.upload_id.get()) else {
                continue;
            };
            view.add(
                meta,
                commit.as_str(),
                lodestar_core::VisibilityToken::new(root, indexer),
            );
        }
    }
    view
}

/// Keep dumps whose root covers the query path.
pub(crate) fn covering_dumps(dumps: Vec<DumpRow>, query: &ClosestUploadQuery) -> Vec<DumpRow> {
    dumps
        .into_iter()
        .filter(|dump| root_covers_path(&dump.upload.root, &query.path, query.root_must_enclose_path))
        .collect()
}

pub(crate) fn ids_of(uploads: &[UploadMeta]) -> Vec<UploadId> {
    uploads.iter().map(|meta| meta.upload_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_view_skips_unknown_uploads() {
        let visible = vec![
            (
                "c1".to_string(),
                vec![
                    UploadMeta::new(UploadId::new(1), 0),
                    UploadMeta::new(UploadId::new(9), 2),
                ],
            ),
            ("c2".to_string(), vec![UploadMeta::new(UploadId::new(1), 1)]),
        ];
        assert_eq!(upload_ids(&visible), vec![1, 9]);

        let identities = HashMap::from([(1, (String::new(), "scip-go".to_string()))]);
        let view = fragment_view(visible, &identities);
        assert_eq!(view.upload_count(), 1);
        assert_eq!(view.meta("c1"), &[UploadMeta::new(UploadId::new(1), 0)]);
        assert_eq!(view.meta("c2"), &[UploadMeta::new(UploadId::new(1), 1)]);
    }
}
