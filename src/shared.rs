//! Small helpers shared across subcommands.

use duct::cmd;
use log::info;
use snafu::ResultExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::config;

/// Writes a file, creating parent directories and logging whether the path
/// is new or replaced.
pub fn write_file_logged(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        info!("Updating {}", path.display());
    } else {
        info!("Creating {}", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
    }
    fs::write(path, contents).context(error::FileWriteSnafu { path })
}

/// Appends a data path to the repository's .gitignore; data files are
/// restorable from the object store and should never be committed.
pub fn add_to_gitignore(path: &Path) -> Result<()> {
    let gitignore = Path::new(".gitignore");
    if gitignore.exists() {
        info!("Updating .gitignore");
    } else {
        info!("Creating .gitignore");
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(gitignore)
        .context(error::FileWriteSnafu { path: gitignore })?;
    writeln!(file, "{}", path.display()).context(error::FileWriteSnafu { path: gitignore })
}

/// Opens a file in the user's interactive editor.
pub fn open_in_editor(path: &Path) -> Result<()> {
    let editor = config::editor();
    cmd(&editor, [path])
        .run()
        .context(error::EditorSnafu { editor })?;
    Ok(())
}

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
        CreateDir { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to run editor '{}': {}", editor, source))]
        Editor { editor: String, source: io::Error },

        #[snafu(display("Failed to write '{}': {}", path.display(), source))]
        FileWrite { path: PathBuf, source: io::Error },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
