//! Content hashing for files, directories, and manifests.
//!
//! A directory is summarized by a manifest: a sorted map from each file's
//! forward-slash relative path to its SHA-256 checksum. The manifest itself
//! rolls up to a single checksum by hashing the concatenated path and
//! checksum bytes in sorted order, which is deterministic across platforms.

use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};
use walkdir::WalkDir;

/// Lowercase hex SHA-256 digest.
pub type Checksum = String;

/// Relative path to checksum, in canonical sorted order.
pub type Manifest = BTreeMap<String, Checksum>;

/// Basenames that never contribute to a directory's contents.
const IGNORE_FILES: &[&str] = &[".DS_Store"];

/// Hashes a file's bytes, streaming in 4 KiB blocks to bound memory.
pub fn checksum_file<P: AsRef<Path>>(path: P) -> Result<Checksum> {
    let path = path.as_ref();
    let mut file = File::open(path).context(error::FileOpenSnafu { path })?;
    let mut sha256 = Sha256::new();
    let mut block = [0u8; 4096];
    loop {
        let n = file.read(&mut block).context(error::FileReadSnafu { path })?;
        if n == 0 {
            break;
        }
        sha256.update(&block[..n]);
    }
    Ok(hex::encode(sha256.finalize()))
}

/// Walks a directory tree and hashes every file in it.
///
/// Entries are keyed by forward-slash relative path regardless of platform.
/// An empty directory has no meaningful checksum and is an error.
pub fn checksum_folder(dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.context(error::WalkSnafu { path: dir })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if IGNORE_FILES.contains(&name.as_ref()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walked path starts with its root");
        manifest.insert(relative_key(rel)?, checksum_file(entry.path())?);
    }

    ensure!(!manifest.is_empty(), error::EmptyFolderSnafu { path: dir });
    Ok(manifest)
}

/// Rolls a manifest up into a single checksum over its sorted entries.
pub fn checksum_manifest(manifest: &Manifest) -> Checksum {
    let mut sha256 = Sha256::new();
    for (path, checksum) in manifest {
        sha256.update(path.as_bytes());
        sha256.update(checksum.as_bytes());
    }
    hex::encode(sha256.finalize())
}

/// Joins a relative path's components with forward slashes.
fn relative_key(rel: &Path) -> Result<String> {
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(segment) => segments.push(
                segment
                    .to_str()
                    .context(error::NonUtf8PathSnafu { path: rel })?,
            ),
            _ => return error::NonUtf8PathSnafu { path: rel }.fail(),
        }
    }
    Ok(segments.join("/"))
}

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("No files found in '{}' to checksum", path.display()))]
        EmptyFolder { path: PathBuf },

        #[snafu(display("Failed to open '{}': {}", path.display(), source))]
        FileOpen { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        FileRead { path: PathBuf, source: io::Error },

        #[snafu(display("Non-UTF8 path '{}' not supported", path.display()))]
        NonUtf8Path { path: PathBuf },

        #[snafu(display("Failed to walk directory '{}': {}", path.display(), source))]
        Walk {
            path: PathBuf,
            source: walkdir::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
