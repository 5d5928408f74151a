//! Upload identifiers, lifecycle states and root/path matching.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a precise code-intelligence upload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(i64);

impl UploadId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw database identifier.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for UploadId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload lifecycle state.
///
/// `uploading -> queued -> processing -> completed -> deleting -> deleted`,
/// with `failed` reachable from any pre-completion state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Uploading,
    Queued,
    Processing,
    Completed,
    Failed,
    /// Soft-deleted; still referenced by the persisted visibility tables.
    Deleting,
    /// No longer reachable from any commit.
    Deleted,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// Only completed uploads seed the commit graph and answer queries.
    pub fn is_visible(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if the upload reached a state it can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Check whether moving to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Uploading, Queued | Failed | Deleted)
                | (Queued, Processing | Failed | Deleted)
                | (Processing, Completed | Failed | Queued | Deleted)
                | (Completed, Deleting)
                | (Failed, Queued | Deleted)
                | (Deleting, Deleted)
        )
    }

    /// Validate a transition, returning the target state on success.
    pub fn transition_to(&self, next: UploadState) -> crate::Result<UploadState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(crate::Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    /// State assigned by an explicit soft delete of an upload in this state.
    pub fn soft_deleted(&self) -> Option<UploadState> {
        match self {
            Self::Deleted | Self::Deleting => None,
            Self::Completed => Some(Self::Deleting),
            _ => Some(Self::Deleted),
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::InvalidUploadState(other.to_string())),
        }
    }
}

/// An upload visible from some commit, `distance` hops away from the commit
/// that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadMeta {
    pub upload_id: UploadId,
    pub distance: u32,
}

impl UploadMeta {
    pub const fn new(upload_id: UploadId, distance: u32) -> Self {
        Self {
            upload_id,
            distance,
        }
    }

    /// Ordering key used to pick a winner between uploads sharing a token.
    pub(crate) fn precedence(&self) -> (u32, UploadId) {
        (self.distance, self.upload_id)
    }
}

/// Check whether an upload rooted at `root` can answer queries about `path`.
///
/// With `root_must_enclose_path` the root has to be a prefix of the path;
/// otherwise either one being a prefix of the other is enough.
pub fn root_covers_path(root: &str, path: &str, root_must_enclose_path: bool) -> bool {
    if path.starts_with(root) {
        return true;
    }
    !root_must_enclose_path && root.starts_with(path)
}
