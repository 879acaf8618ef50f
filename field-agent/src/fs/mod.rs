//! Filesystem helpers: tree walking, file stamps, and staged writes.

pub mod atomic;
pub mod metadata;
pub mod walker;

pub use atomic::StagedFile;
pub use metadata::FileStamp;
pub use walker::{walk_directory, FileInfo, WalkOptions, WalkOutcome};
