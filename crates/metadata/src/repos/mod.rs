//! Repository traits for metadata operations.

pub mod closest;
pub mod commit_graph;
pub mod dirty;
pub mod retention;
pub mod uploads;

pub use closest::ClosestUploadRepo;
pub use commit_graph::CommitGraphRepo;
pub use dirty::DirtyRepositoryRepo;
pub use retention::RetentionRepo;
pub use uploads::UploadRepo;
