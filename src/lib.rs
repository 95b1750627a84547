/*!
`shelf` manages a content-addressable shelf of data: a DAG of build steps
whose outputs are identified by SHA-256 checksums and mirrored in an
S3-compatible object store.

Two step kinds exist. A *snapshot* is a user-provided file or directory
uploaded into the store verbatim; a *table* is a derived artifact produced
by running a user script over its dependencies. The registry (`shelf.yaml`)
records the graph; the planner prunes it to the steps whose inputs have
changed; the executor materializes snapshots by fetch and tables by script.
*/

pub mod audit;
pub mod checksum;
pub mod config;
pub mod execute;
pub mod paths;
pub mod plan;
pub mod registry;
pub mod schemas;
pub mod shared;
pub mod snapshot;
pub mod store;
pub mod table;
pub mod uri;
