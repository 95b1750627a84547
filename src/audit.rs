//! The audit walks every registered step and cross-checks its stored
//! metadata against recomputed checksums.
//!
//! Table records are regenerated on every build and verified by the
//! planner, so only snapshots need attention here: a directory snapshot's
//! checksum must equal the roll-up of its stored manifest. With `fix` set,
//! a mismatched checksum is recomputed and the record rewritten.

use log::{debug, info};
use snafu::{ensure, OptionExt, ResultExt};

use crate::checksum::checksum_manifest;
use crate::registry::Shelf;
use crate::snapshot::{Snapshot, SnapshotType};
use crate::uri::Scheme;

pub fn audit(shelf: &Shelf, fix: bool) -> Result<()> {
    for step in shelf.steps.keys() {
        if step.scheme != Scheme::Snapshot {
            debug!("{} is validated at build time, skipping", step);
            continue;
        }

        let mut snapshot =
            Snapshot::load(&step.path).context(error::LoadSnafu { uri: step.clone() })?;
        if snapshot.snapshot_type != SnapshotType::Directory {
            continue;
        }

        let manifest = snapshot
            .manifest
            .as_ref()
            .context(error::MissingManifestSnafu { uri: step.clone() })?;
        let expected = checksum_manifest(manifest);
        if expected == snapshot.checksum {
            continue;
        }

        ensure!(
            fix,
            error::ChecksumMismatchSnafu {
                uri: step.clone(),
                stored: snapshot.checksum.clone(),
                expected: expected.clone(),
            }
        );
        info!("Fixing checksum of {}", step);
        snapshot.checksum = expected;
        snapshot
            .save()
            .context(error::SaveSnafu { uri: step.clone() })?;
    }
    Ok(())
}

pub mod error {
    use snafu::Snafu;

    use crate::uri::StepURI;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "Checksum of {} does not match its manifest (stored {}, expected {}); \
             re-run with --fix to repair",
            uri,
            stored,
            expected
        ))]
        ChecksumMismatch {
            uri: StepURI,
            stored: String,
            expected: String,
        },

        #[snafu(display("Failed to load snapshot {}: {}", uri, source))]
        Load {
            uri: StepURI,
            source: crate::snapshot::Error,
        },

        #[snafu(display("Directory snapshot '{}' has no manifest", uri))]
        MissingManifest { uri: StepURI },

        #[snafu(display("Failed to save repaired snapshot {}: {}", uri, source))]
        Save {
            uri: StepURI,
            source: crate::snapshot::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{checksum_folder, checksum_manifest};
    use crate::registry::Shelf;
    use crate::snapshot::Snapshot;
    use crate::test_support::WorkingDir;
    use crate::uri::{Scheme, StepURI};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn directory_snapshot() -> Snapshot {
        fs::create_dir_all("data/snapshots/ns/dir/latest").unwrap();
        fs::write("data/snapshots/ns/dir/latest/file1.txt", "Hello, World!").unwrap();
        fs::write("data/snapshots/ns/dir/latest/file2.txt", "Hello, Cosmos!").unwrap();
        let manifest = checksum_folder(Path::new("data/snapshots/ns/dir/latest")).unwrap();
        Snapshot {
            uri: StepURI::new(Scheme::Snapshot, "ns/dir/latest"),
            version: 1,
            snapshot_type: SnapshotType::Directory,
            checksum: checksum_manifest(&manifest),
            extension: None,
            manifest: Some(manifest),
            name: None,
            source_name: None,
            source_url: None,
            date_accessed: None,
            access_notes: None,
        }
    }

    #[test]
    fn audit_detects_and_fixes_corrupt_checksums() {
        let dir = TempDir::new().unwrap();
        let _cwd = WorkingDir::change_to(dir.path());

        let snapshot = directory_snapshot();
        let good_checksum = snapshot.checksum.clone();
        snapshot.save().unwrap();

        let mut shelf = Shelf::init(Path::new("shelf.yaml")).unwrap();
        shelf.add_snapshot(snapshot.uri.clone()).unwrap();
        shelf.save().unwrap();

        // Clean metadata passes.
        audit(&shelf, false).unwrap();

        // Corrupt the stored checksum.
        let mut corrupted = snapshot.clone();
        corrupted.checksum = "0".repeat(64);
        corrupted.save().unwrap();

        assert!(matches!(
            audit(&shelf, false),
            Err(Error::ChecksumMismatch { .. })
        ));

        // The record is untouched by a failed audit.
        assert_eq!(
            Snapshot::load("ns/dir/latest").unwrap().checksum,
            "0".repeat(64)
        );

        // --fix restores the roll-up checksum.
        audit(&shelf, true).unwrap();
        assert_eq!(
            Snapshot::load("ns/dir/latest").unwrap().checksum,
            good_checksum
        );
    }

    #[test]
    fn audit_skips_file_snapshots_and_tables() {
        let dir = TempDir::new().unwrap();
        let _cwd = WorkingDir::change_to(dir.path());

        let mut shelf = Shelf::init(Path::new("shelf.yaml")).unwrap();
        let file = Snapshot {
            uri: StepURI::new(Scheme::Snapshot, "ns/file/2024-01-01"),
            version: 1,
            snapshot_type: SnapshotType::File,
            checksum: "0".repeat(64),
            extension: Some(".txt".to_string()),
            manifest: None,
            name: None,
            source_name: None,
            source_url: None,
            date_accessed: None,
            access_notes: None,
        };
        file.save().unwrap();
        shelf.add_snapshot(file.uri.clone()).unwrap();
        shelf
            .add_table(
                StepURI::new(Scheme::Table, "ns/table/2024-01-01"),
                vec![file.uri.clone()],
            )
            .unwrap();

        // Neither kind is checked here, so a bogus file checksum and an
        // unbuilt table are both fine.
        audit(&shelf, false).unwrap();
    }
}
