//! Core domain types and the commit-graph visibility algorithm for lodestar.
//!
//! This crate defines the model shared by the persistence layer and the CLI:
//! - Commit graph input and ref descriptions
//! - Upload identifiers and lifecycle
//! - Visibility tokens (shadowing identity)
//! - The compressed landmark/link visibility graph
//! - Non-stale ref selection for tip visibility

pub mod config;
pub mod error;
pub mod graph;
pub mod refs;
pub mod token;
pub mod upload;
pub mod view;
pub mod visibility;

pub use error::{Error, Result};
pub use graph::{CommitGraph, RefDescription, RefDescriptions, RefType};
pub use refs::{RefVisibility, StaleRefPolicy, TipRefs};
pub use token::VisibilityToken;
pub use upload::{UploadId, UploadMeta, UploadState, root_covers_path};
pub use view::CommitGraphView;
pub use visibility::{LinkRelationship, NearestUploads, VisibilityGraph, VisibilityRow};
