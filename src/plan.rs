//! The planner reduces the registered DAG to the steps worth running.
//!
//! Two passes: an optional regex selection keeps every match plus all of
//! its ancestors and descendants, then dirty pruning walks the remainder in
//! topological order and keeps a step when its own up-to-date check fails
//! or any dependency is already dirty.

use regex::Regex;
use snafu::ResultExt;
use std::collections::{BTreeMap, BTreeSet};

use crate::uri::{Dag, Scheme, StepURI};
use crate::{snapshot, table};

/// Produces the sub-DAG to execute. An empty result means everything that
/// was asked for is already up to date.
pub fn plan(dag: &Dag, pattern: Option<&Regex>, force: bool) -> Result<Dag> {
    let mut selected = match pattern {
        Some(pattern) => select_matching(dag, pattern),
        None => dag.clone(),
    };
    if !force {
        selected = prune_completed(&selected)?;
    }
    Ok(selected)
}

/// Keeps the steps whose URI matches the pattern, together with everything
/// they depend on and everything that depends on them.
pub fn select_matching(dag: &Dag, pattern: &Regex) -> Dag {
    let mut dependents: BTreeMap<&StepURI, Vec<&StepURI>> = BTreeMap::new();
    for (step, deps) in dag {
        for dep in deps {
            dependents.entry(dep).or_default().push(step);
        }
    }

    let mut queue: Vec<&StepURI> = dag
        .keys()
        .filter(|step| pattern.is_match(&step.to_string()))
        .collect();
    let mut keep = BTreeSet::new();
    while let Some(step) = queue.pop() {
        if !keep.insert(step.clone()) {
            continue;
        }
        queue.extend(dag[step].iter());
        if let Some(downstream) = dependents.get(step) {
            queue.extend(downstream.iter().copied());
        }
    }

    restrict(dag, &keep)
}

/// Drops every step that is already up to date, propagating dirtiness from
/// dependencies to dependents.
pub fn prune_completed(dag: &Dag) -> Result<Dag> {
    let mut dirty = BTreeSet::new();
    for step in topological_sort(dag)? {
        let deps = &dag[&step];
        let needs_run =
            deps.iter().any(|dep| dirty.contains(dep)) || !is_completed(&step, deps)?;
        if needs_run {
            dirty.insert(step);
        }
    }
    Ok(restrict(dag, &dirty))
}

/// The up-to-date check for a single step.
pub fn is_completed(step: &StepURI, dependencies: &[StepURI]) -> Result<bool> {
    match step.scheme {
        Scheme::Snapshot => {
            snapshot::is_completed(step).context(error::SnapshotSnafu { uri: step.clone() })
        }
        Scheme::Table => table::is_completed(step, dependencies)
            .context(error::TableSnafu { uri: step.clone() }),
    }
}

/// Kahn's algorithm, dependencies first, ties broken by URI order so runs
/// are deterministic.
pub fn topological_sort(dag: &Dag) -> Result<Vec<StepURI>> {
    let mut dependents: BTreeMap<&StepURI, Vec<&StepURI>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&StepURI, usize> = BTreeMap::new();
    for (step, deps) in dag {
        let local: Vec<_> = deps.iter().filter(|d| dag.contains_key(*d)).collect();
        in_degree.insert(step, local.len());
        for dep in local {
            dependents.entry(dep).or_default().push(step);
        }
    }

    let mut ready: BTreeSet<&StepURI> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(step, _)| *step)
        .collect();

    let mut order = Vec::with_capacity(dag.len());
    while let Some(step) = ready.iter().next().copied() {
        ready.remove(step);
        order.push(step.clone());
        if let Some(downstream) = dependents.get(step) {
            for &dependent in downstream {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("every step has an in-degree");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != dag.len() {
        let stuck: Vec<String> = dag
            .keys()
            .filter(|step| !order.contains(*step))
            .map(ToString::to_string)
            .collect();
        return error::CycleSnafu { steps: stuck }.fail();
    }
    Ok(order)
}

fn restrict(dag: &Dag, keep: &BTreeSet<StepURI>) -> Dag {
    dag.iter()
        .filter(|(step, _)| keep.contains(*step))
        .map(|(step, deps)| {
            (
                step.clone(),
                deps.iter().filter(|d| keep.contains(*d)).cloned().collect(),
            )
        })
        .collect()
}

pub mod error {
    use snafu::Snafu;

    use crate::uri::StepURI;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Dependency cycle among steps: {}", steps.join(", ")))]
        Cycle { steps: Vec<String> },

        #[snafu(display("Failed to check snapshot {}: {}", uri, source))]
        Snapshot {
            uri: StepURI,
            source: crate::snapshot::Error,
        },

        #[snafu(display("Failed to check table {}: {}", uri, source))]
        Table {
            uri: StepURI,
            source: crate::table::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
