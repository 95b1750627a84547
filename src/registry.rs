//! The registry module owns `shelf.yaml`, the canonical record of the build
//! graph: every step URI and the dependencies it was declared with.
//!
//! The on-disk form is validated against the shelf schema in both
//! directions, and the graph invariants (every dependency registered, no
//! cycles, every URI versioned) are rechecked on load and save.

use log::info;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::SHELF_FILE;
use crate::uri::{Dag, StepURI};
use crate::{plan, schemas, shared};

/// The serialized shape of shelf.yaml.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShelfFile {
    version: u32,
    data_dir: String,
    steps: BTreeMap<String, Vec<String>>,
}

/// The in-memory registry.
#[derive(Debug)]
pub struct Shelf {
    pub config_file: PathBuf,
    pub data_dir: String,
    pub version: u32,
    pub steps: Dag,
}

impl Shelf {
    /// Loads the registry from the repository root.
    pub fn open() -> Result<Self> {
        Self::load(Path::new(SHELF_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        ensure!(path.exists(), error::NotFoundSnafu { path });
        let raw = fs::read_to_string(path).context(error::FileReadSnafu { path })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&raw).context(error::InvalidYamlSnafu { path })?;

        let json = schemas::to_json_value(&value).context(error::SchemaSnafu)?;
        schemas::validate_shelf(&json).context(error::SchemaSnafu)?;
        let file: ShelfFile =
            serde_yaml::from_value(value).context(error::InvalidYamlSnafu { path })?;

        let mut steps = Dag::new();
        for (step, deps) in file.steps {
            let uri = parse_registered(&step)?;
            let deps = deps
                .iter()
                .map(|d| parse_registered(d))
                .collect::<Result<Vec<_>>>()?;
            steps.insert(uri, deps);
        }
        validate_dag(&steps)?;

        Ok(Self {
            config_file: path.to_path_buf(),
            data_dir: file.data_dir,
            version: file.version,
            steps,
        })
    }

    /// Creates a minimal shelf.yaml if none exists, then loads it.
    pub fn init(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("{} already exists", path.display());
        } else {
            let file = ShelfFile {
                version: 1,
                data_dir: "data".to_string(),
                steps: BTreeMap::new(),
            };
            let yaml = serde_yaml::to_string(&file).context(error::SerializeSnafu)?;
            shared::write_file_logged(path, &yaml).context(error::FileLogWriteSnafu)?;
        }
        Self::load(path)
    }

    /// Saves the registry, steps sorted by URI, after re-validating it.
    pub fn save(&self) -> Result<()> {
        validate_dag(&self.steps)?;
        let file = ShelfFile {
            version: self.version,
            data_dir: self.data_dir.clone(),
            steps: self
                .steps
                .iter()
                .map(|(uri, deps)| {
                    (
                        uri.to_string(),
                        deps.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect(),
        };
        let json = schemas::to_json_value(&file).context(error::SchemaSnafu)?;
        schemas::validate_shelf(&json).context(error::SchemaSnafu)?;

        let yaml = serde_yaml::to_string(&file).context(error::SerializeSnafu)?;
        shared::write_file_logged(&self.config_file, &yaml).context(error::FileLogWriteSnafu)
    }

    /// Registers a new snapshot step with no dependencies.
    pub fn add_snapshot(&mut self, uri: StepURI) -> Result<()> {
        ensure!(
            !self.steps.contains_key(&uri),
            error::AlreadyRegisteredSnafu { uri }
        );
        self.steps.insert(uri, Vec::new());
        Ok(())
    }

    /// Registers a new table step; its dependencies must already be present.
    pub fn add_table(&mut self, uri: StepURI, dependencies: Vec<StepURI>) -> Result<()> {
        ensure!(
            !self.steps.contains_key(&uri),
            error::AlreadyRegisteredSnafu { uri }
        );
        for dep in &dependencies {
            ensure!(
                self.steps.contains_key(dep),
                error::UnknownDependencySnafu {
                    step: uri.clone(),
                    dependency: dep.clone(),
                }
            );
        }
        self.steps.insert(uri, dependencies);
        Ok(())
    }

    /// Resolves a `latest`-versioned URI to the greatest dated sibling in
    /// the registry, if any.
    pub fn latest_of(&self, uri: &StepURI) -> Option<StepURI> {
        let prefix = match uri.path.rsplit_once('/') {
            Some((prefix, "latest")) => prefix,
            _ => return None,
        };
        self.steps
            .keys()
            .filter(|candidate| {
                candidate.scheme == uri.scheme
                    && matches!(
                        candidate.path.rsplit_once('/'),
                        Some((p, version)) if p == prefix && version != "latest"
                    )
            })
            .max()
            .cloned()
    }
}

fn parse_registered(uri: &str) -> Result<StepURI> {
    let uri = StepURI::parse(uri).context(error::UriSnafu)?;
    uri.validate_version().context(error::UriSnafu)?;
    Ok(uri)
}

/// Checks the graph is closed over its dependencies and acyclic.
fn validate_dag(steps: &Dag) -> Result<()> {
    for (step, deps) in steps {
        for dep in deps {
            ensure!(
                steps.contains_key(dep),
                error::UnknownDependencySnafu {
                    step: step.clone(),
                    dependency: dep.clone(),
                }
            );
        }
    }
    plan::topological_sort(steps).context(error::DependencyCycleSnafu)?;
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
        #[snafu(display("Step '{}' is already registered", uri))]
        AlreadyRegistered { uri: StepURI },

        #[snafu(display("{}", source))]
        DependencyCycle { source: crate::plan::Error },

        #[snafu(display("Failed to write registry: {}", source))]
        FileLogWrite { source: crate::shared::Error },

        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        FileRead { path: PathBuf, source: io::Error },

        #[snafu(display("Invalid YAML in '{}': {}", path.display(), source))]
        InvalidYaml {
            path: PathBuf,
            source: serde_yaml::Error,
        },

        #[snafu(display("shelf.yaml not found at '{}'; run 'shelf init' first", path.display()))]
        NotFound { path: PathBuf },

        #[snafu(display("{}", source))]
        Schema { source: crate::schemas::Error },

        #[snafu(display("Failed to serialize registry: {}", source))]
        Serialize { source: serde_yaml::Error },

        #[snafu(display(
            "Step '{}' depends on '{}', which is not registered",
            step,
            dependency
        ))]
        UnknownDependency {
            step: StepURI,
            dependency: StepURI,
        },

        #[snafu(display("{}", source))]
        Uri { source: crate::uri::Error },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn uri(s: &str) -> StepURI {
        StepURI::parse(s).unwrap()
    }

    #[test]
    fn init_creates_minimal_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelf.yaml");

        let shelf = Shelf::init(&path).unwrap();
        assert_eq!(shelf.version, 1);
        assert_eq!(shelf.data_dir, "data");
        assert!(shelf.steps.is_empty());
        assert!(path.exists());

        // A second init leaves the file alone.
        let again = Shelf::init(&path).unwrap();
        assert!(again.steps.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelf.yaml");

        let mut shelf = Shelf::init(&path).unwrap();
        shelf.add_snapshot(uri("snapshot://a/b/2024-07-26")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/c/2024-07-26")).unwrap();
        shelf
            .add_table(
                uri("table://reports/summary/2024-07-26"),
                vec![
                    uri("snapshot://a/b/2024-07-26"),
                    uri("snapshot://a/c/2024-07-26"),
                ],
            )
            .unwrap();
        shelf.save().unwrap();

        let reloaded = Shelf::load(&path).unwrap();
        assert_eq!(reloaded.steps, shelf.steps);

        // Saving what we loaded is byte-identical.
        reloaded.save().unwrap();
        let first = fs::read_to_string(&path).unwrap();
        Shelf::load(&path).unwrap().save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn save_sorts_steps_by_uri() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelf.yaml");

        let mut shelf = Shelf::init(&path).unwrap();
        shelf.add_snapshot(uri("snapshot://z/z/2024-07-26")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/a/2024-07-26")).unwrap();
        shelf.save().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let a = raw.find("snapshot://a/a").unwrap();
        let z = raw.find("snapshot://z/z").unwrap();
        assert!(a < z);
    }

    #[test]
    fn load_rejects_unregistered_dependency() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelf.yaml");
        fs::write(
            &path,
            "version: 1\ndata_dir: data\nsteps:\n  table://a/b/2024-07-26:\n  - snapshot://missing/dep/2024-07-26\n",
        )
        .unwrap();

        assert!(matches!(
            Shelf::load(&path),
            Err(Error::UnknownDependency { .. })
        ));
    }

    #[test]
    fn load_rejects_cycles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelf.yaml");
        fs::write(
            &path,
            "version: 1\ndata_dir: data\nsteps:\n  table://a/b/2024-07-26:\n  - table://c/d/2024-07-26\n  table://c/d/2024-07-26:\n  - table://a/b/2024-07-26\n",
        )
        .unwrap();

        assert!(matches!(
            Shelf::load(&path),
            Err(Error::DependencyCycle { .. })
        ));
    }

    #[test]
    fn load_rejects_unversioned_uris() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shelf.yaml");
        fs::write(
            &path,
            "version: 1\ndata_dir: data\nsteps:\n  snapshot://unversioned: []\n",
        )
        .unwrap();

        assert!(Shelf::load(&path).is_err());
    }

    #[test]
    fn missing_registry_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Shelf::load(&dir.path().join("shelf.yaml")),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let dir = TempDir::new().unwrap();
        let mut shelf = Shelf::init(&dir.path().join("shelf.yaml")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/b/2024-07-26")).unwrap();
        assert!(matches!(
            shelf.add_snapshot(uri("snapshot://a/b/2024-07-26")),
            Err(Error::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn table_dependencies_must_be_registered() {
        let dir = TempDir::new().unwrap();
        let mut shelf = Shelf::init(&dir.path().join("shelf.yaml")).unwrap();
        assert!(matches!(
            shelf.add_table(
                uri("table://a/b/2024-07-26"),
                vec![uri("snapshot://missing/dep/2024-07-26")],
            ),
            Err(Error::UnknownDependency { .. })
        ));
    }

    #[test]
    fn latest_of_returns_greatest_dated_version() {
        let dir = TempDir::new().unwrap();
        let mut shelf = Shelf::init(&dir.path().join("shelf.yaml")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/b/2024-01-01")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/b/2024-02-01")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/b/latest")).unwrap();
        shelf.add_snapshot(uri("snapshot://a/c/2024-03-01")).unwrap();

        assert_eq!(
            shelf.latest_of(&uri("snapshot://a/b/latest")),
            Some(uri("snapshot://a/b/2024-02-01"))
        );
        assert_eq!(shelf.latest_of(&uri("snapshot://a/b/2024-01-01")), None);
        assert_eq!(shelf.latest_of(&uri("snapshot://x/y/latest")), None);
    }
}
