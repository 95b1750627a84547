//! Well-known locations inside a shelf repository.
//!
//! These are deliberately relative paths; everything keys off the process
//! working directory, which is expected to be the repository root. Keeping
//! them lazy this way also lets tests point the whole tree at a tempdir.

/// The canonical registry file at the repository root.
pub const SHELF_FILE: &str = "shelf.yaml";

/// Where snapshot data and metadata live.
pub const SNAPSHOT_DIR: &str = "data/snapshots";

/// Where table outputs and metadata live.
pub const TABLE_DIR: &str = "data/tables";

/// Where user-authored table build scripts live.
pub const TABLE_SCRIPT_DIR: &str = "steps/tables";
