/*!
`shelf` is a content-addressable data build system.

A repository holds a `shelf.yaml` registry describing a DAG of steps:
snapshots (imported files or directories) and tables (artifacts derived by
user scripts). Data lives under `data/`, addressed in the object store by
its SHA-256 checksum, so `shelf run` can always rebuild exactly the steps
whose inputs changed and nothing else.

Object store configuration comes from the environment: `S3_ACCESS_KEY`,
`S3_SECRET_KEY`, `S3_ENDPOINT_URL`, and `S3_BUCKET_NAME`.
*/

use clap::{Parser, Subcommand};
use regex::Regex;
use simplelog::{CombinedLogger, Config as LogConfig, ConfigBuilder, LevelFilter, SimpleLogger};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::process;

use shelf::config::StoreConfig;
use shelf::registry::Shelf;
use shelf::snapshot::Snapshot;
use shelf::store::ObjectStore;
use shelf::uri::{Scheme, StepURI};
use shelf::{audit, execute, paths, plan, shared, table, uri};

/// Manages a content-addressable shelf of data snapshots and derived tables.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    #[arg(global = true, long, default_value = "INFO")]
    /// How much detail to log; from least to most: ERROR, WARN, INFO, DEBUG, TRACE
    log_level: LevelFilter,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Create shelf.yaml in the current directory if it does not exist
    Init,
    /// Add a file or directory snapshot to the shelf
    Snapshot(SnapshotArgs),
    /// Fetch and build every step that is out of date
    Run(RunArgs),
    /// List registered steps in sorted order
    List(ListArgs),
    /// Verify stored metadata, optionally repairing what can be repaired
    Audit(AuditArgs),
    /// Build everything, then load every table into a DuckDB database
    ExportDuckdb(ExportDuckdbArgs),
    /// Register a new table step with a placeholder build script
    NewTable(NewTableArgs),
}

#[derive(Debug, clap::Args)]
struct SnapshotArgs {
    /// File or directory to add
    local_path: PathBuf,
    /// Dataset name, e.g. 'who/flu_surveillance' or 'who/flu_surveillance/2024-07-26';
    /// today's date is appended when the version is omitted
    dataset_name: String,
    /// Open the new metadata record in $EDITOR
    #[arg(long)]
    edit: bool,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Only consider steps matching this regex, plus their ancestors and descendants
    pattern: Option<String>,
    /// Re-run steps even when they are up to date
    #[arg(long)]
    force: bool,
    /// Print the plan in execution order without running it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, clap::Args)]
struct ListArgs {
    /// Only list steps matching this regex
    pattern: Option<String>,
    /// Print on-disk data paths instead of URIs
    #[arg(long)]
    paths: bool,
}

#[derive(Debug, clap::Args)]
struct AuditArgs {
    /// Repair what can be repaired instead of failing
    #[arg(long)]
    fix: bool,
}

#[derive(Debug, clap::Args)]
struct ExportDuckdbArgs {
    /// DuckDB database file to create or update
    db_file: PathBuf,
}

#[derive(Debug, clap::Args)]
struct NewTableArgs {
    /// Table path, e.g. 'reports/summary'; today's date is appended when the
    /// version is omitted
    table_path: String,
    /// URIs of registered steps this table depends on
    dependencies: Vec<String>,
    /// Open the new build script in $EDITOR
    #[arg(long)]
    edit: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level)?;

    match args.subcommand {
        SubCommand::Init => {
            Shelf::init(Path::new(paths::SHELF_FILE)).context(error::RegistrySnafu)?;
            Ok(())
        }
        SubCommand::Snapshot(ref snapshot_args) => add_snapshot(snapshot_args),
        SubCommand::Run(ref run_args) => run_steps(run_args),
        SubCommand::List(ref list_args) => list_steps(list_args),
        SubCommand::Audit(ref audit_args) => {
            let shelf = Shelf::open().context(error::RegistrySnafu)?;
            audit::audit(&shelf, audit_args.fix).context(error::AuditSnafu)
        }
        SubCommand::ExportDuckdb(ref export_args) => export_duckdb(export_args),
        SubCommand::NewTable(ref new_table_args) => new_table(new_table_args),
    }
}

/// Sends our own logs through at the requested level while keeping the AWS
/// SDK's internals quiet unless something is actually wrong.
fn init_logger(log_level: LevelFilter) -> Result<()> {
    match log_level {
        LevelFilter::Info => CombinedLogger::init(vec![
            SimpleLogger::new(
                LevelFilter::Info,
                ConfigBuilder::new()
                    .add_filter_ignore_str("aws_config")
                    .add_filter_ignore_str("aws_smithy")
                    .add_filter_ignore_str("hyper")
                    .add_filter_ignore_str("tracing::span")
                    .build(),
            ),
            SimpleLogger::new(
                LevelFilter::Warn,
                ConfigBuilder::new()
                    .add_filter_allow_str("aws_config")
                    .add_filter_allow_str("aws_smithy")
                    .add_filter_allow_str("hyper")
                    .add_filter_allow_str("tracing::span")
                    .build(),
            ),
        ])
        .context(error::LoggerSnafu),
        _ => SimpleLogger::init(log_level, LogConfig::default()).context(error::LoggerSnafu),
    }
}

fn add_snapshot(args: &SnapshotArgs) -> Result<()> {
    let mut shelf = Shelf::open().context(error::RegistrySnafu)?;
    let dataset = uri::ensure_versioned(&args.dataset_name).context(error::UriSnafu)?;
    let step = StepURI::new(Scheme::Snapshot, dataset.clone());

    // Register first so a duplicate fails before we touch the store.
    shelf.add_snapshot(step).context(error::RegistrySnafu)?;

    let store = object_store()?;
    let snapshot =
        Snapshot::create(&args.local_path, &dataset, &store).context(error::SnapshotSnafu)?;
    shared::add_to_gitignore(&snapshot.data_path()).context(error::SharedSnafu)?;
    shelf.save().context(error::RegistrySnafu)?;

    if args.edit {
        shared::open_in_editor(&snapshot.metadata_path()).context(error::SharedSnafu)?;
    }
    Ok(())
}

fn run_steps(args: &RunArgs) -> Result<()> {
    let shelf = Shelf::open().context(error::RegistrySnafu)?;
    let pattern = compile_pattern(args.pattern.as_deref())?;
    let selected =
        plan::plan(&shelf.steps, pattern.as_ref(), args.force).context(error::PlanSnafu)?;

    if args.dry_run {
        return execute::dry_run(&selected).context(error::ExecuteSnafu);
    }

    // Table-only plans never talk to the object store.
    let store = if selected.keys().any(|step| step.scheme == Scheme::Snapshot) {
        Some(object_store()?)
    } else {
        None
    };
    execute::execute_dag(&selected, store.as_ref()).context(error::ExecuteSnafu)
}

fn list_steps(args: &ListArgs) -> Result<()> {
    let shelf = Shelf::open().context(error::RegistrySnafu)?;
    let pattern = compile_pattern(args.pattern.as_deref())?;

    for step in shelf.steps.keys() {
        if let Some(pattern) = &pattern {
            if !pattern.is_match(&step.to_string()) {
                continue;
            }
        }
        if args.paths {
            println!("{}", step_data_path(step)?.display());
        } else {
            println!("{}", step);
        }
    }
    Ok(())
}

fn export_duckdb(args: &ExportDuckdbArgs) -> Result<()> {
    let shelf = Shelf::open().context(error::RegistrySnafu)?;

    // Bring the whole shelf up to date before exporting.
    let selected = plan::plan(&shelf.steps, None, false).context(error::PlanSnafu)?;
    let store = if selected.keys().any(|step| step.scheme == Scheme::Snapshot) {
        Some(object_store()?)
    } else {
        None
    };
    execute::execute_dag(&selected, store.as_ref()).context(error::ExecuteSnafu)?;

    table::export_duckdb(&shelf.steps, &args.db_file).context(error::TableSnafu)
}

fn new_table(args: &NewTableArgs) -> Result<()> {
    let mut shelf = Shelf::open().context(error::RegistrySnafu)?;
    let table_path = uri::ensure_versioned(&args.table_path).context(error::UriSnafu)?;
    let step = StepURI::new(Scheme::Table, table_path);

    let dependencies = args
        .dependencies
        .iter()
        .map(|dep| StepURI::parse(dep))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context(error::UriSnafu)?;
    shelf
        .add_table(step.clone(), dependencies)
        .context(error::RegistrySnafu)?;

    let script = table::add_placeholder_script(&step).context(error::TableSnafu)?;
    shared::add_to_gitignore(&table::output_path(&step)).context(error::SharedSnafu)?;
    shelf.save().context(error::RegistrySnafu)?;

    if args.edit {
        shared::open_in_editor(&script).context(error::SharedSnafu)?;
    }
    Ok(())
}

fn object_store() -> Result<ObjectStore> {
    let config = StoreConfig::from_env().context(error::ConfigSnafu)?;
    ObjectStore::new(&config).context(error::StoreSnafu)
}

fn compile_pattern(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        Some(pattern) => Ok(Some(
            Regex::new(pattern).context(error::InvalidRegexSnafu { pattern })?,
        )),
        None => Ok(None),
    }
}

/// The on-disk data location for a step, relative to the repository root.
fn step_data_path(step: &StepURI) -> Result<PathBuf> {
    match step.scheme {
        Scheme::Snapshot => Ok(Snapshot::load(&step.path)
            .context(error::SnapshotSnafu)?
            .data_path()),
        Scheme::Table => Ok(table::output_path(step)),
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("{}", source))]
        Audit { source: shelf::audit::Error },

        #[snafu(display("{}", source))]
        Config { source: shelf::config::Error },

        #[snafu(display("{}", source))]
        Execute { source: shelf::execute::Error },

        #[snafu(display("Invalid regex '{}': {}", pattern, source))]
        InvalidRegex {
            pattern: String,
            source: regex::Error,
        },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("{}", source))]
        Plan { source: shelf::plan::Error },

        #[snafu(display("{}", source))]
        Registry { source: shelf::registry::Error },

        #[snafu(display("{}", source))]
        Shared { source: shelf::shared::Error },

        #[snafu(display("{}", source))]
        Snapshot { source: shelf::snapshot::Error },

        #[snafu(display("{}", source))]
        Store { source: shelf::store::Error },

        #[snafu(display("{}", source))]
        Table { source: shelf::table::Error },

        #[snafu(display("{}", source))]
        Uri { source: shelf::uri::Error },
    }
}
type Result<T> = std::result::Result<T, error::Error>;
