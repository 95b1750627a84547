//! The executor walks a planned sub-DAG in topological order and runs one
//! step at a time: snapshots fetch from the object store, tables build by
//! script. A failing step halts the run; everything built before it is
//! already valid on disk.

use log::info;
use snafu::{OptionExt, ResultExt};

use crate::snapshot::Snapshot;
use crate::store::ObjectStore;
use crate::table;
use crate::uri::{Dag, Scheme, StepURI};
use crate::plan;

/// Executes every step in the sub-DAG. The store is only needed when the
/// plan contains snapshot steps.
pub fn execute_dag(dag: &Dag, store: Option<&ObjectStore>) -> Result<()> {
    let order = plan::topological_sort(dag).context(error::PlanSnafu)?;
    if order.is_empty() {
        info!("Everything is up to date");
        return Ok(());
    }

    info!("Executing {} steps", order.len());
    for step in &order {
        info!("{}", step);
        execute_step(step, &dag[step], store)?;
    }
    Ok(())
}

/// Prints the planned steps in execution order without running anything.
pub fn dry_run(dag: &Dag) -> Result<()> {
    let order = plan::topological_sort(dag).context(error::PlanSnafu)?;
    if order.is_empty() {
        println!("Everything is up to date");
        return Ok(());
    }
    for step in &order {
        println!("{}", step);
    }
    Ok(())
}

fn execute_step(step: &StepURI, dependencies: &[StepURI], store: Option<&ObjectStore>) -> Result<()> {
    match step.scheme {
        Scheme::Snapshot => {
            let store = store.context(error::StoreRequiredSnafu { uri: step.clone() })?;
            Snapshot::load(&step.path)
                .context(error::SnapshotSnafu { uri: step.clone() })?
                .fetch(store)
                .context(error::SnapshotSnafu { uri: step.clone() })
        }
        Scheme::Table => {
            table::build(step, dependencies).context(error::TableSnafu { uri: step.clone() })
        }
    }
}

pub mod error {
    use snafu::Snafu;

    use crate::uri::StepURI;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", source))]
        Plan { source: crate::plan::Error },

        #[snafu(display("Failed to materialize snapshot {}: {}", uri, source))]
        Snapshot {
            uri: StepURI,
            source: crate::snapshot::Error,
        },

        #[snafu(display("No object store configured, needed to fetch {}", uri))]
        StoreRequired { uri: StepURI },

        #[snafu(display("Failed to build table {}: {}", uri, source))]
        Table {
            uri: StepURI,
            source: crate::table::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
