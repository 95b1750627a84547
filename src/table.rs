//! Table steps: derived artifacts produced by running a user script over
//! the step's dependencies.
//!
//! The build command is always `[script, dep-path..., output-path]`. Python
//! scripts run under the interpreter and other executables run directly;
//! `.sql` scripts are rendered as templates and executed in DuckDB, which
//! must leave the result in a table named `data`.
//!
//! A table's cache key is its input manifest: the checksum of the script
//! plus the checksum of every dependency's *metadata* file. Since each
//! metadata file embeds its own data checksum, any change to a dependency's
//! data or description invalidates the table.

use duckdb::Connection;
use duct::cmd;
use log::info;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tinytemplate::TinyTemplate;

use crate::checksum::{checksum_file, Checksum};
use crate::paths::{TABLE_DIR, TABLE_SCRIPT_DIR};
use crate::snapshot::{self, Snapshot, DESCRIPTIVE_FIELDS};
use crate::uri::{Dag, Scheme, StepURI};
use crate::{schemas, shared};

const PYTHON: &str = "python3";

const PLACEHOLDER_SCRIPT: &str = r#"#!/usr/bin/env python3
#
# Placeholder build script. Arguments are the data paths of this table's
# dependencies, in declaration order, followed by the output path.
#
import sys

import polars as pl

df = pl.DataFrame(
    {
        "dim_id": [1, 2, 3],
        "value": [2, 3, 5],
    }
)

df.write_parquet(sys.argv[-1])
"#;

/// The persisted table record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Table {
    pub uri: StepURI,
    pub version: u32,
    pub checksum: Checksum,
    pub input_manifest: BTreeMap<String, Checksum>,

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

    pub schema: BTreeMap<String, String>,
}

/// Where a table's output lands.
pub fn output_path(uri: &StepURI) -> PathBuf {
    PathBuf::from(format!("{}/{}.parquet", TABLE_DIR, uri.path))
}

/// The table's metadata record, next to the output.
pub fn metadata_path(uri: &StepURI) -> PathBuf {
    PathBuf::from(format!("{}/{}.meta.yaml", TABLE_DIR, uri.path))
}

/// The metadata record of any dependency, whatever its kind.
pub fn dependency_metadata_path(dep: &StepURI) -> PathBuf {
    match dep.scheme {
        Scheme::Snapshot => snapshot::metadata_path(&dep.path),
        Scheme::Table => metadata_path(dep),
    }
}

/// Finds the build script for a table step.
///
/// Candidates in order: `<path>.py`, `<path>.sql`, then the same pair with
/// the version segment dropped, so one script can implement every version
/// of a dataset.
pub fn find_script(uri: &StepURI) -> Result<PathBuf> {
    let mut stems = vec![uri.path.clone()];
    if let Some((prefix, _version)) = uri.path.rsplit_once('/') {
        stems.push(prefix.to_string());
    }
    for stem in &stems {
        for ext in ["py", "sql"] {
            let candidate = PathBuf::from(format!("{}/{}.{}", TABLE_SCRIPT_DIR, stem, ext));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    error::NoScriptSnafu { uri: uri.clone() }.fail()
}

/// Builds a table: run its script, then regenerate its metadata.
pub fn build(uri: &StepURI, dependencies: &[StepURI]) -> Result<()> {
    let command = build_command(uri, dependencies)?;
    run_command(uri, &command)?;
    generate_metadata(uri, dependencies)
}

/// `[script, dep-data-path..., output-path]`, with each dependency resolved
/// to its on-disk data location.
fn build_command(uri: &StepURI, dependencies: &[StepURI]) -> Result<Vec<PathBuf>> {
    let mut command = vec![find_script(uri)?];
    for dep in dependencies {
        command.push(dependency_data_path(dep)?);
    }
    command.push(output_path(uri));
    Ok(command)
}

fn dependency_data_path(dep: &StepURI) -> Result<PathBuf> {
    match dep.scheme {
        Scheme::Snapshot => Ok(Snapshot::load(&dep.path)
            .context(error::DependencySnafu { uri: dep.clone() })?
            .data_path()),
        Scheme::Table => Ok(output_path(dep)),
    }
}

fn run_command(uri: &StepURI, command: &[PathBuf]) -> Result<()> {
    let script = &command[0];
    let dest = &command[command.len() - 1];

    info!("Executing {}", script.display());
    // Remove any stale output so we can tell whether the script produced one.
    if dest.exists() {
        fs::remove_file(dest).context(error::RemoveOutputSnafu { path: dest })?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
    }

    if script.extension().and_then(|e| e.to_str()) == Some("sql") {
        run_sql(uri, command)?;
    } else {
        run_script(uri, command)?;
    }

    ensure!(
        dest.exists(),
        error::NoOutputSnafu {
            uri: uri.clone(),
            path: dest,
        }
    );
    Ok(())
}

fn run_script(uri: &StepURI, command: &[PathBuf]) -> Result<()> {
    let script = &command[0];
    let mut argv: Vec<OsString> = command.iter().map(|p| p.as_os_str().to_owned()).collect();

    let expression = if script.extension().and_then(|e| e.to_str()) == Some("py") {
        cmd(PYTHON, &argv)
    } else {
        let program = argv.remove(0);
        cmd(program, &argv)
    };

    expression.run().context(error::ScriptSnafu {
        uri: uri.clone(),
        script: script.clone(),
    })?;
    Ok(())
}

/// Renders and executes a SQL step. The template sees `{output_file}` plus
/// one variable per dependency holding its data path; the query must leave
/// its result in a table named `data`.
fn run_sql(uri: &StepURI, command: &[PathBuf]) -> Result<()> {
    let script = &command[0];
    let dependencies = &command[1..command.len() - 1];
    let output = &command[command.len() - 1];

    let template = fs::read_to_string(script).context(error::FileReadSnafu { path: script })?;

    let mut variables: HashMap<String, String> = HashMap::new();
    variables.insert("output_file".to_string(), output.display().to_string());
    for (name, dep) in simplify_dependency_names(dependencies)? {
        variables.insert(name, dep.display().to_string());
    }

    let mut renderer = TinyTemplate::new();
    renderer.set_default_formatter(&tinytemplate::format_unescaped);
    renderer
        .add_template("step", &template)
        .context(error::TemplateSnafu { path: script })?;
    let rendered = renderer
        .render("step", &variables)
        .context(error::TemplateSnafu { path: script })?;

    let conn = Connection::open_in_memory().context(error::DuckDbSnafu)?;
    conn.execute_batch(&rendered)
        .context(error::QuerySnafu { uri: uri.clone() })?;
    conn.execute_batch(&format!(
        "COPY (SELECT * FROM data) TO '{}' (FORMAT 'parquet')",
        sql_quote(output)
    ))
    .context(error::QuerySnafu { uri: uri.clone() })?;
    Ok(())
}

/// Gives each dependency path a short unique template name.
///
/// Every dependency starts from its penultimate path segment (the dataset
/// name) and grows leftward one segment per round while it collides with
/// another dependency; the final fallback appends the dashless version.
/// Each round must shrink the colliding set, otherwise we fail rather than
/// loop forever.
fn simplify_dependency_names(dependencies: &[PathBuf]) -> Result<BTreeMap<String, PathBuf>> {
    fn name_at(candidates: &[Vec<String>], i: usize, round: usize) -> &str {
        let names = &candidates[i];
        &names[round.min(names.len() - 1)]
    }

    let candidates: Vec<Vec<String>> = dependencies.iter().map(|d| candidate_names(d)).collect();

    let mut resolved = BTreeMap::new();
    let mut unresolved: Vec<usize> = (0..dependencies.len()).collect();
    let mut round = 0;
    while !unresolved.is_empty() {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for &i in &unresolved {
            *counts.entry(name_at(&candidates, i, round)).or_insert(0) += 1;
        }

        let mut progressed = false;
        let mut still_colliding = Vec::new();
        for &i in &unresolved {
            let name = name_at(&candidates, i, round);
            if counts[name] == 1 && !resolved.contains_key(name) {
                resolved.insert(name.to_string(), dependencies[i].clone());
                progressed = true;
            } else {
                still_colliding.push(i);
            }
        }

        if !progressed {
            let exhausted = still_colliding
                .iter()
                .all(|&i| round >= candidates[i].len() - 1);
            ensure!(
                !exhausted,
                error::AmbiguousDependenciesSnafu {
                    dependencies: dependencies.to_vec(),
                }
            );
        }
        unresolved = still_colliding;
        round += 1;
    }
    Ok(resolved)
}

fn candidate_names(dependency: &Path) -> Vec<String> {
    let segments: Vec<String> = dependency
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let last = &segments[segments.len() - 1];
    let version = Path::new(last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| last.clone())
        .replace('-', "");

    if segments.len() < 2 {
        return vec![version];
    }

    let mut names = Vec::new();
    let mut name = segments[segments.len() - 2].clone();
    names.push(name.clone());
    for segment in segments[..segments.len() - 2].iter().rev() {
        name = format!("{}_{}", segment, name);
        names.push(name.clone());
    }
    names.push(format!("{}_{}", name, version));
    names
}

/// Regenerates the metadata record after a successful build.
fn generate_metadata(uri: &StepURI, dependencies: &[StepURI]) -> Result<()> {
    let output = output_path(uri);
    let mut record = Table {
        uri: uri.clone(),
        version: 1,
        checksum: checksum_file(&output).context(error::ChecksumSnafu)?,
        input_manifest: generate_input_manifest(uri, dependencies)?,
        name: None,
        source_name: None,
        source_url: None,
        date_accessed: None,
        access_notes: None,
        schema: infer_schema(&output)?,
    };

    if let [only] = dependencies {
        inherit_metadata(&mut record, only)?;
    }

    let json = schemas::to_json_value(&record).context(error::SchemaSnafu)?;
    schemas::validate_table(&json).context(error::SchemaSnafu)?;
    ensure!(
        record.schema.keys().any(|column| column.starts_with("dim_")),
        error::NoDimensionColumnsSnafu { uri: uri.clone() }
    );

    let yaml = serde_yaml::to_string(&record).context(error::SerializeSnafu)?;
    shared::write_file_logged(&metadata_path(uri), &yaml).context(error::FileLogWriteSnafu)
}

/// The table's cache key: checksums of the build script and of every
/// dependency's metadata file, keyed by absolute path.
fn generate_input_manifest(
    uri: &StepURI,
    dependencies: &[StepURI],
) -> Result<BTreeMap<String, Checksum>> {
    let mut manifest = BTreeMap::new();

    let script = find_script(uri)?;
    manifest.insert(
        absolute_key(&script)?,
        checksum_file(&script).context(error::ChecksumSnafu)?,
    );
    for dep in dependencies {
        let metadata_file = dependency_metadata_path(dep);
        manifest.insert(
            absolute_key(&metadata_file)?,
            checksum_file(&metadata_file).context(error::ChecksumSnafu)?,
        );
    }
    Ok(manifest)
}

/// With a single dependency the table is a refinement of it, so carry its
/// descriptive fields over.
fn inherit_metadata(record: &mut Table, dependency: &StepURI) -> Result<()> {
    let path = dependency_metadata_path(dependency);
    let raw = fs::read_to_string(&path).context(error::FileReadSnafu { path: &path })?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&raw).context(error::InvalidYamlSnafu { path })?;

    for field in DESCRIPTIVE_FIELDS {
        let inherited = value.get(field).and_then(|v| v.as_str()).map(String::from);
        if inherited.is_none() {
            continue;
        }
        match *field {
            "name" => record.name = inherited,
            "source_name" => record.source_name = inherited,
            "source_url" => record.source_url = inherited,
            "date_accessed" => record.date_accessed = inherited,
            "access_notes" => record.access_notes = inherited,
            _ => {}
        }
    }
    Ok(())
}

/// Reads the output's column names and types back out of DuckDB.
fn infer_schema(output: &Path) -> Result<BTreeMap<String, String>> {
    let conn = Connection::open_in_memory().context(error::DuckDbSnafu)?;
    let describe = format!(
        "DESCRIBE SELECT * FROM read_parquet('{}')",
        sql_quote(output)
    );
    let mut statement = conn
        .prepare(&describe)
        .context(error::SchemaInferenceSnafu { path: output })?;
    let mut rows = statement
        .query([])
        .context(error::SchemaInferenceSnafu { path: output })?;

    let mut schema = BTreeMap::new();
    while let Some(row) = rows
        .next()
        .context(error::SchemaInferenceSnafu { path: output })?
    {
        let column: String = row.get(0).context(error::SchemaInferenceSnafu { path: output })?;
        let dtype: String = row.get(1).context(error::SchemaInferenceSnafu { path: output })?;
        schema.insert(column, dtype);
    }
    Ok(schema)
}

/// True when the table's output exists and its input manifest still matches
/// both the world and the declared dependency set.
pub fn is_completed(uri: &StepURI, declared: &[StepURI]) -> Result<bool> {
    if !output_path(uri).exists() || !metadata_path(uri).exists() {
        return Ok(false);
    }

    let record = load_record(uri)?;
    for (path, recorded) in &record.input_manifest {
        let path = Path::new(path);
        if !path.exists() {
            return Ok(false);
        }
        if checksum_file(path).context(error::ChecksumSnafu)? != *recorded {
            return Ok(false);
        }
    }

    // A manifest that hashes clean can still be stale if the declared
    // dependencies have changed since the table was built.
    let script = match find_script(uri) {
        Ok(script) => script,
        Err(_) => return Ok(false),
    };
    let mut expected = BTreeSet::new();
    expected.insert(absolute_key(&script)?);
    for dep in declared {
        match absolute_key(&dependency_metadata_path(dep)) {
            Ok(key) => {
                expected.insert(key);
            }
            Err(_) => return Ok(false),
        }
    }
    let recorded: BTreeSet<String> = record.input_manifest.keys().cloned().collect();
    Ok(expected == recorded)
}

/// Loads and validates the metadata record for a table step.
pub fn load_record(uri: &StepURI) -> Result<Table> {
    let path = metadata_path(uri);
    let raw = fs::read_to_string(&path).context(error::FileReadSnafu { path: &path })?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&raw).context(error::InvalidYamlSnafu { path: &path })?;

    let json = schemas::to_json_value(&value).context(error::SchemaSnafu)?;
    schemas::validate_table(&json).context(error::SchemaSnafu)?;
    serde_yaml::from_value(value).context(error::InvalidYamlSnafu { path })
}

/// Loads every table output into an analytical database for exploration.
pub fn export_duckdb(dag: &Dag, db_file: &Path) -> Result<()> {
    let conn = Connection::open(db_file).context(error::DuckDbOpenSnafu { path: db_file })?;
    for uri in dag.keys().filter(|uri| uri.scheme == Scheme::Table) {
        let name = export_table_name(uri);
        info!("Loading {} into {} as {}", uri, db_file.display(), name);
        conn.execute_batch(&format!(
            r#"CREATE OR REPLACE TABLE "{}" AS SELECT * FROM read_parquet('{}')"#,
            name,
            sql_quote(&output_path(uri))
        ))
        .context(error::QuerySnafu { uri: uri.clone() })?;
    }
    Ok(())
}

/// `table://a/b/2024-07-26` exports as `a_b_20240726`. The mapping stays
/// injective because every URI ends in its version segment.
fn export_table_name(uri: &StepURI) -> String {
    let mut segments: Vec<String> = uri.path.split('/').map(String::from).collect();
    if let Some(version) = segments.last_mut() {
        *version = version.replace('-', "");
    }
    segments.join("_")
}

/// Writes a placeholder Python script for a newly registered table step.
pub fn add_placeholder_script(uri: &StepURI) -> Result<PathBuf> {
    let script = PathBuf::from(format!("{}/{}.py", TABLE_SCRIPT_DIR, uri.path));
    ensure!(
        !script.exists(),
        error::ScriptExistsSnafu { path: script }
    );

    shared::write_file_logged(&script, PLACEHOLDER_SCRIPT).context(error::FileLogWriteSnafu)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .context(error::PermissionsSnafu { path: &script })?;
    }
    Ok(script)
}

fn absolute_key(path: &Path) -> Result<String> {
    let canonical = fs::canonicalize(path).context(error::CanonicalizeSnafu { path })?;
    Ok(canonical
        .to_str()
        .context(error::NonUtf8PathSnafu { path: &canonical })?
        .to_string())
}

/// Escapes a path for embedding in a single-quoted SQL literal.
fn sql_quote(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    use crate::uri::StepURI;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "Could not find unique names for dependencies {:?}",
            dependencies
        ))]
        AmbiguousDependencies { dependencies: Vec<PathBuf> },

        #[snafu(display("Failed to resolve '{}': {}", path.display(), source))]
        Canonicalize { path: PathBuf, source: io::Error },

        #[snafu(display("{}", source))]
        Checksum { source: crate::checksum::Error },

        #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
        CreateDir { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to load dependency '{}': {}", uri, source))]
        Dependency {
            uri: StepURI,
            source: crate::snapshot::Error,
        },

        #[snafu(display("Failed to open DuckDB in memory: {}", source))]
        DuckDb { source: duckdb::Error },

        #[snafu(display("Failed to open DuckDB database '{}': {}", path.display(), source))]
        DuckDbOpen {
            path: PathBuf,
            source: duckdb::Error,
        },

        #[snafu(display("Failed to write table metadata: {}", source))]
        FileLogWrite { source: crate::shared::Error },

        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        FileRead { path: PathBuf, source: io::Error },

        #[snafu(display("Invalid YAML in '{}': {}", path.display(), source))]
        InvalidYaml {
            path: PathBuf,
            source: serde_yaml::Error,
        },

        #[snafu(display(
            "Table {} has no dimension columns prefixed with dim_",
            uri
        ))]
        NoDimensionColumns { uri: StepURI },

        #[snafu(display("Table step {} did not generate the expected '{}'", uri, path.display()))]
        NoOutput { uri: StepURI, path: PathBuf },

        #[snafu(display(
            "No build script found for table step {} under '{}'",
            uri,
            crate::paths::TABLE_SCRIPT_DIR
        ))]
        NoScript { uri: StepURI },

        #[snafu(display("Non-UTF8 path '{}' not supported", path.display()))]
        NonUtf8Path { path: PathBuf },

        #[snafu(display("Failed to set permissions on '{}': {}", path.display(), source))]
        Permissions { path: PathBuf, source: io::Error },

        #[snafu(display("Query for table step {} failed: {}", uri, source))]
        Query { uri: StepURI, source: duckdb::Error },

        #[snafu(display("Failed to remove stale output '{}': {}", path.display(), source))]
        RemoveOutput { path: PathBuf, source: io::Error },

        #[snafu(display("{}", source))]
        Schema { source: crate::schemas::Error },

        #[snafu(display("Failed to read schema of '{}': {}", path.display(), source))]
        SchemaInference {
            path: PathBuf,
            source: duckdb::Error,
        },

        #[snafu(display("Script '{}' for table step {} failed: {}", script.display(), uri, source))]
        Script {
            uri: StepURI,
            script: PathBuf,
            source: io::Error,
        },

        #[snafu(display("Script already exists: '{}'", path.display()))]
        ScriptExists { path: PathBuf },

        #[snafu(display("Failed to serialize table metadata: {}", source))]
        Serialize { source: serde_yaml::Error },

        #[snafu(display("Failed to render SQL template '{}': {}", path.display(), source))]
        Template {
            path: PathBuf,
            source: tinytemplate::error::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
