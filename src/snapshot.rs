//! Snapshot steps: external files or directories imported into the shelf.
//!
//! A snapshot's data lives under `data/snapshots/` next to a `.meta.yaml`
//! record. The record's checksum is the content address: for a file, the
//! hash of its bytes; for a directory, the roll-up hash of its manifest.
//! Fetching materializes the data from the object store by checksum alone.

use log::info;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::checksum::{checksum_file, checksum_folder, checksum_manifest, Checksum, Manifest};
use crate::paths::SNAPSHOT_DIR;
use crate::store::ObjectStore;
use crate::uri::{Scheme, StepURI};
use crate::{schemas, shared};

/// Descriptive fields a user fills in by hand; a table with exactly one
/// dependency inherits them from it.
pub const DESCRIPTIVE_FIELDS: &[&str] = &[
    "name",
    "source_name",
    "source_url",
    "date_accessed",
    "access_notes",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    File,
    Directory,
}

/// The persisted snapshot record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub uri: StepURI,
    pub version: u32,
    pub snapshot_type: SnapshotType,
    pub checksum: Checksum,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_accessed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_notes: Option<String>,
}

impl Snapshot {
    /// Where this snapshot's data lives on disk.
    pub fn data_path(&self) -> PathBuf {
        match self.snapshot_type {
            SnapshotType::File => PathBuf::from(format!(
                "{}/{}{}",
                SNAPSHOT_DIR,
                self.uri.path,
                self.extension.as_deref().unwrap_or_default()
            )),
            SnapshotType::Directory => Path::new(SNAPSHOT_DIR).join(&self.uri.path),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        metadata_path(&self.uri.path)
    }

    /// Loads and validates the record for a dataset path.
    pub fn load(dataset_path: &str) -> Result<Self> {
        let path = metadata_path(dataset_path);
        ensure!(path.exists(), error::MissingMetadataSnafu { path });
        let raw = fs::read_to_string(&path).context(error::FileReadSnafu { path: &path })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&raw).context(error::InvalidYamlSnafu { path: &path })?;

        let json = schemas::to_json_value(&value).context(error::SchemaSnafu)?;
        schemas::validate_snapshot(&json).context(error::SchemaSnafu)?;
        serde_yaml::from_value(value).context(error::InvalidYamlSnafu { path })
    }

    /// Imports a local file or directory as a new snapshot: copy into the
    /// data directory, upload to the object store, write the record.
    pub fn create(local: &Path, dataset_path: &str, store: &ObjectStore) -> Result<Self> {
        ensure!(local.exists(), error::MissingSourceSnafu { path: local });
        if local.is_dir() {
            Self::create_from_directory(local, dataset_path, store)
        } else {
            Self::create_from_file(local, dataset_path, store)
        }
    }

    fn create_from_file(local: &Path, dataset_path: &str, store: &ObjectStore) -> Result<Self> {
        let checksum = checksum_file(local).context(error::ChecksumSnafu)?;

        let extension = match local.extension() {
            Some(ext) => format!(
                ".{}",
                ext.to_str().context(error::NonUtf8PathSnafu { path: local })?
            ),
            None => String::new(),
        };
        let snapshot = Self {
            uri: StepURI::new(Scheme::Snapshot, dataset_path),
            version: 1,
            snapshot_type: SnapshotType::File,
            checksum,
            extension: Some(extension),
            manifest: None,
            name: None,
            source_name: None,
            source_url: None,
            date_accessed: None,
            access_notes: None,
        };

        copy_file(local, &snapshot.data_path())?;
        store
            .put(&snapshot.data_path(), &snapshot.checksum)
            .context(error::StoreSnafu)?;
        snapshot.save_new()?;
        Ok(snapshot)
    }

    fn create_from_directory(
        local: &Path,
        dataset_path: &str,
        store: &ObjectStore,
    ) -> Result<Self> {
        let data_path = Path::new(SNAPSHOT_DIR).join(dataset_path);
        copy_dir(local, &data_path)?;

        let manifest = checksum_folder(&data_path).context(error::ChecksumSnafu)?;
        for (rel, checksum) in &manifest {
            store
                .put(&data_path.join(rel), checksum)
                .context(error::StoreSnafu)?;
        }

        let snapshot = Self {
            uri: StepURI::new(Scheme::Snapshot, dataset_path),
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
        };
        snapshot.save_new()?;
        Ok(snapshot)
    }

    /// Writes the record back out after validating it.
    pub fn save(&self) -> Result<()> {
        shared::write_file_logged(&self.metadata_path(), &self.render()?)
            .context(error::FileLogWriteSnafu)
    }

    /// Like `save`, but appends commented placeholders for the descriptive
    /// fields the user has not filled in yet, so `--edit` presents a form.
    fn save_new(&self) -> Result<()> {
        let mut rendered = self.render()?;
        for (field, value) in [
            ("name", &self.name),
            ("source_name", &self.source_name),
            ("source_url", &self.source_url),
            ("date_accessed", &self.date_accessed),
            ("access_notes", &self.access_notes),
        ] {
            if value.is_none() {
                rendered.push_str(&format!("# {}:\n", field));
            }
        }
        shared::write_file_logged(&self.metadata_path(), &rendered)
            .context(error::FileLogWriteSnafu)
    }

    fn render(&self) -> Result<String> {
        let json = schemas::to_json_value(self).context(error::SchemaSnafu)?;
        schemas::validate_snapshot(&json).context(error::SchemaSnafu)?;
        serde_yaml::to_string(self).context(error::SerializeSnafu)
    }

    /// True when the local data still matches the recorded checksum.
    pub fn is_up_to_date(&self) -> Result<bool> {
        let path = self.data_path();
        match self.snapshot_type {
            SnapshotType::File => {
                if !path.is_file() {
                    return Ok(false);
                }
                Ok(checksum_file(&path).context(error::ChecksumSnafu)? == self.checksum)
            }
            SnapshotType::Directory => {
                if !path.is_dir() {
                    return Ok(false);
                }
                match checksum_folder(&path) {
                    Ok(manifest) => Ok(checksum_manifest(&manifest) == self.checksum),
                    Err(crate::checksum::Error::EmptyFolder { .. }) => Ok(false),
                    Err(e) => Err(e).context(error::ChecksumSnafu),
                }
            }
        }
    }

    /// Materializes the snapshot's data from the object store.
    pub fn fetch(&self, store: &ObjectStore) -> Result<()> {
        match self.snapshot_type {
            SnapshotType::File => store
                .get(&self.checksum, &self.data_path())
                .context(error::StoreSnafu),
            SnapshotType::Directory => {
                let manifest = self
                    .manifest
                    .as_ref()
                    .context(error::MissingManifestSnafu {
                        uri: self.uri.clone(),
                    })?;
                let root = self.data_path();
                for (rel, checksum) in manifest {
                    let dest = safe_join(&root, rel)?;
                    store.get(checksum, &dest).context(error::StoreSnafu)?;
                }
                Ok(())
            }
        }
    }
}

/// True when the snapshot registered at this URI needs no work.
pub fn is_completed(uri: &StepURI) -> Result<bool> {
    Snapshot::load(&uri.path)?.is_up_to_date()
}

pub fn metadata_path(dataset_path: &str) -> PathBuf {
    PathBuf::from(format!("{}/{}.meta.yaml", SNAPSHOT_DIR, dataset_path))
}

/// Joins a manifest's relative path onto the dataset root, refusing
/// anything that would escape it.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    let escapes = rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    ensure!(!escapes, error::PathEscapeSnafu { path: rel });
    Ok(root.join(rel_path))
}

fn copy_file(local: &Path, data_path: &Path) -> Result<()> {
    if let Some(parent) = data_path.parent() {
        fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
    }
    info!("Copying {} to {}", local.display(), data_path.display());
    fs::copy(local, data_path).context(error::FileCopySnafu {
        from: local,
        to: data_path,
    })?;
    Ok(())
}

fn copy_dir(local: &Path, data_path: &Path) -> Result<()> {
    info!("Copying {}/ to {}/", local.display(), data_path.display());
    for entry in WalkDir::new(local) {
        let entry = entry.context(error::WalkSnafu { path: local })?;
        let rel = entry
            .path()
            .strip_prefix(local)
            .expect("walked path starts with its root");
        let dest = data_path.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).context(error::CreateDirSnafu { path: &dest })?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
            }
            fs::copy(entry.path(), &dest).context(error::FileCopySnafu {
                from: entry.path(),
                to: &dest,
            })?;
        }
    }
    Ok(())
}

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    use crate::uri::StepURI;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", source))]
        Checksum { source: crate::checksum::Error },

        #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
        CreateDir { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to copy '{}' to '{}': {}", from.display(), to.display(), source))]
        FileCopy {
            from: PathBuf,
            to: PathBuf,
            source: io::Error,
        },

        #[snafu(display("Failed to write snapshot metadata: {}", source))]
        FileLogWrite { source: crate::shared::Error },

        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        FileRead { path: PathBuf, source: io::Error },

        #[snafu(display("Invalid YAML in '{}': {}", path.display(), source))]
        InvalidYaml {
            path: PathBuf,
            source: serde_yaml::Error,
        },

        #[snafu(display("Directory snapshot '{}' has no manifest", uri))]
        MissingManifest { uri: StepURI },

        #[snafu(display("No snapshot metadata found at '{}'", path.display()))]
        MissingMetadata { path: PathBuf },

        #[snafu(display("No file or directory at '{}'", path.display()))]
        MissingSource { path: PathBuf },

        #[snafu(display("Non-UTF8 path '{}' not supported", path.display()))]
        NonUtf8Path { path: PathBuf },

        #[snafu(display("Manifest path '{}' escapes the dataset root", path))]
        PathEscape { path: String },

        #[snafu(display("{}", source))]
        Schema { source: crate::schemas::Error },

        #[snafu(display("Failed to serialize snapshot metadata: {}", source))]
        Serialize { source: serde_yaml::Error },

        #[snafu(display("{}", source))]
        Store { source: crate::store::Error },

        #[snafu(display("Failed to walk directory '{}': {}", path.display(), source))]
        Walk {
            path: PathBuf,
            source: walkdir::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::WorkingDir;
    use tempfile::TempDir;

    fn file_snapshot(dataset_path: &str, checksum: &str) -> Snapshot {
        Snapshot {
            uri: StepURI::new(Scheme::Snapshot, dataset_path),
            version: 1,
            snapshot_type: SnapshotType::File,
            checksum: checksum.to_string(),
            extension: Some(".txt".to_string()),
            manifest: None,
            name: None,
            source_name: None,
            source_url: None,
            date_accessed: None,
            access_notes: None,
        }
    }

    #[test]
    fn record_round_trips_with_placeholders() {
        let dir = TempDir::new().unwrap();
        let _cwd = WorkingDir::change_to(dir.path());

        let snapshot = file_snapshot(
            "test_namespace/test_dataset/2024-07-26",
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
        );
        snapshot.save_new().unwrap();

        let raw = fs::read_to_string(snapshot.metadata_path()).unwrap();
        assert!(raw.contains("# name:"));
        assert!(raw.contains("# source_url:"));

        let loaded = Snapshot::load("test_namespace/test_dataset/2024-07-26").unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn data_paths_follow_snapshot_type() {
        let file = file_snapshot(
            "a/b/2024-07-26",
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
        );
        assert_eq!(
            file.data_path(),
            PathBuf::from("data/snapshots/a/b/2024-07-26.txt")
        );

        let mut directory = file;
        directory.snapshot_type = SnapshotType::Directory;
        directory.extension = None;
        assert_eq!(
            directory.data_path(),
            PathBuf::from("data/snapshots/a/b/2024-07-26")
        );
    }

    #[test]
    fn file_up_to_date_tracks_contents() {
        let dir = TempDir::new().unwrap();
        let _cwd = WorkingDir::change_to(dir.path());

        fs::create_dir_all("data/snapshots/a/b").unwrap();
        fs::write("data/snapshots/a/b/2024-07-26.txt", "Hello, World!").unwrap();

        let snapshot = file_snapshot(
            "a/b/2024-07-26",
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
        );
        assert!(snapshot.is_up_to_date().unwrap());

        fs::write("data/snapshots/a/b/2024-07-26.txt", "Modified content").unwrap();
        assert!(!snapshot.is_up_to_date().unwrap());

        fs::remove_file("data/snapshots/a/b/2024-07-26.txt").unwrap();
        assert!(!snapshot.is_up_to_date().unwrap());
    }

    #[test]
    fn directory_up_to_date_tracks_manifest_rollup() {
        let dir = TempDir::new().unwrap();
        let _cwd = WorkingDir::change_to(dir.path());

        fs::create_dir_all("data/snapshots/a/b/latest").unwrap();
        fs::write("data/snapshots/a/b/latest/file1.txt", "Hello, World!").unwrap();
        let manifest = checksum_folder(Path::new("data/snapshots/a/b/latest")).unwrap();

        let snapshot = Snapshot {
            uri: StepURI::new(Scheme::Snapshot, "a/b/latest"),
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
        };
        assert!(snapshot.is_up_to_date().unwrap());

        fs::write("data/snapshots/a/b/latest/file1.txt", "Hello, Cosmos!").unwrap();
        assert!(!snapshot.is_up_to_date().unwrap());
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("data/snapshots/a/b/2024-07-26");
        assert!(safe_join(root, "nested/file.txt").is_ok());
        assert!(matches!(
            safe_join(root, "../evil.txt"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(
            safe_join(root, "/etc/passwd"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(
            safe_join(root, "ok/../../evil.txt"),
            Err(Error::PathEscape { .. })
        ));
    }

    #[test]
    fn loading_missing_metadata_fails() {
        let dir = TempDir::new().unwrap();
        let _cwd = WorkingDir::change_to(dir.path());
        assert!(matches!(
            Snapshot::load("no/such/2024-07-26"),
            Err(Error::MissingMetadata { .. })
        ));
    }
}
