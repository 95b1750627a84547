//! JSON-schema validation for the registry and the metadata records.
//!
//! The schemas are embedded in the binary and compiled once; callers hand in
//! a `serde_json::Value` (YAML documents convert losslessly, since all our
//! keys are strings) and get back either `Ok` or an error listing every
//! violation.

use jsonschema::JSONSchema;
use lazy_static::lazy_static;
use serde::Serialize;
use snafu::ResultExt;

lazy_static! {
    static ref SHELF_JSON: serde_json::Value =
        serde_json::from_str(include_str!("schemas/shelf-v1.schema.json")).unwrap();
    static ref SNAPSHOT_JSON: serde_json::Value =
        serde_json::from_str(include_str!("schemas/snapshot-v1.schema.json")).unwrap();
    static ref TABLE_JSON: serde_json::Value =
        serde_json::from_str(include_str!("schemas/table-v1.schema.json")).unwrap();
    static ref SHELF: JSONSchema = JSONSchema::compile(&SHELF_JSON).unwrap();
    static ref SNAPSHOT: JSONSchema = JSONSchema::compile(&SNAPSHOT_JSON).unwrap();
    static ref TABLE: JSONSchema = JSONSchema::compile(&TABLE_JSON).unwrap();
}

pub fn validate_shelf(instance: &serde_json::Value) -> Result<()> {
    validate(&SHELF, "shelf-v1", instance)
}

pub fn validate_snapshot(instance: &serde_json::Value) -> Result<()> {
    validate(&SNAPSHOT, "snapshot-v1", instance)
}

pub fn validate_table(instance: &serde_json::Value) -> Result<()> {
    validate(&TABLE, "table-v1", instance)
}

/// Converts a serializable record (or a parsed YAML document) into the JSON
/// value the validators work on.
pub fn to_json_value<T: Serialize>(record: &T) -> Result<serde_json::Value> {
    serde_json::to_value(record).context(error::ConvertSnafu)
}

fn validate(schema: &JSONSchema, name: &str, instance: &serde_json::Value) -> Result<()> {
    if let Err(errors) = schema.validate(instance) {
        let problems = errors
            .map(|e| format!("at {}: {}", e.instance_path, e))
            .collect::<Vec<_>>()
            .join("; ");
        return error::ValidationSnafu { name, problems }.fail();
    }
    Ok(())
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to convert record to JSON: {}", source))]
        Convert { source: serde_json::Error },

        #[snafu(display("Record fails the {} schema: {}", name, problems))]
        Validation { name: String, problems: String },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shelf_schema_accepts_minimal_config() {
        let config = json!({
            "version": 1,
            "data_dir": "data",
            "steps": {
                "snapshot://a/b/2024-07-26": [],
                "table://c/d/2024-07-26": ["snapshot://a/b/2024-07-26"],
            }
        });
        assert!(validate_shelf(&config).is_ok());
    }

    #[test]
    fn shelf_schema_rejects_bad_uris_and_versions() {
        let bad_version = json!({"version": 2, "steps": {}});
        assert!(validate_shelf(&bad_version).is_err());

        let bad_uri = json!({
            "version": 1,
            "steps": { "ftp://a/b/2024-07-26": [] }
        });
        assert!(validate_shelf(&bad_uri).is_err());
    }

    #[test]
    fn snapshot_schema_requires_kind_specific_fields() {
        let file = json!({
            "uri": "snapshot://a/b/2024-07-26",
            "version": 1,
            "snapshot_type": "file",
            "checksum": "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
            "extension": ".txt",
        });
        assert!(validate_snapshot(&file).is_ok());

        let mut missing_extension = file.clone();
        missing_extension.as_object_mut().unwrap().remove("extension");
        assert!(validate_snapshot(&missing_extension).is_err());

        let directory = json!({
            "uri": "snapshot://a/b/2024-07-26",
            "version": 1,
            "snapshot_type": "directory",
            "checksum": "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
        });
        assert!(validate_snapshot(&directory).is_err());
    }

    #[test]
    fn table_schema_requires_input_manifest() {
        let table = json!({
            "uri": "table://a/b/2024-07-26",
            "version": 1,
            "checksum": "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
            "input_manifest": {
                "/repo/steps/tables/a/b/2024-07-26.py":
                    "40efcea9db03adb126f27a0f339c595d1828a0713a789ea49d1ae67159d101e0"
            },
            "schema": { "dim_country": "VARCHAR", "population": "BIGINT" },
        });
        assert!(validate_table(&table).is_ok());

        let mut missing = table.clone();
        missing.as_object_mut().unwrap().remove("input_manifest");
        assert!(validate_table(&missing).is_err());
    }
}
