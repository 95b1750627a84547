//! Step URIs identify nodes in the build graph.
//!
//! A URI has the textual form `scheme://path`, where the scheme picks the
//! step kind and the path names the dataset. The final path segment is
//! always a version: either a `YYYY-MM-DD` date or the literal `latest`.
//! Ordering, equality, and hashing all follow the textual form.

use chrono::Local;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref VERSION: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
}

/// The build graph, as an adjacency map from each step to its dependencies.
pub type Dag = BTreeMap<StepURI, Vec<StepURI>>;

/// The two kinds of step we know how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Snapshot,
    Table,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Snapshot => write!(f, "snapshot"),
            Scheme::Table => write!(f, "table"),
        }
    }
}

/// Identifier of a single step, e.g. `snapshot://who/population/2024-07-26`.
// The derived ordering matches ordering on the textual form: the scheme
// names already sort the same way their variants do, and the path is
// compared as-is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepURI {
    pub scheme: Scheme,
    pub path: String,
}

impl StepURI {
    pub fn new(scheme: Scheme, path: impl Into<String>) -> Self {
        Self {
            scheme,
            path: path.into(),
        }
    }

    /// Parses the textual `scheme://path` form.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, path) = uri
            .split_once("://")
            .context(error::MissingSchemeSnafu { uri })?;
        let scheme =
            serde_plain::from_str::<Scheme>(scheme).context(error::UnknownSchemeSnafu { uri })?;
        ensure!(!path.is_empty(), error::MissingPathSnafu { uri });
        Ok(Self {
            scheme,
            path: path.to_string(),
        })
    }

    /// Checks that the path ends in a version segment and has a name before
    /// it; every URI in the registry must satisfy this.
    pub fn validate_version(&self) -> Result<()> {
        let segments: Vec<&str> = self.path.split('/').collect();
        ensure!(
            segments.len() >= 2 && is_version(segments[segments.len() - 1]),
            error::InvalidVersionSnafu { uri: self.clone() }
        );
        Ok(())
    }
}

impl fmt::Display for StepURI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

impl FromStr for StepURI {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for StepURI {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepURI {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StepURI::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// True for `latest` or a `YYYY-MM-DD` date.
pub fn is_version(segment: &str) -> bool {
    segment == "latest" || VERSION.is_match(segment)
}

/// Appends today's date to a dataset path that lacks a version segment.
///
/// A dataset needs both a name and a version, so a single-segment path is
/// rejected whether or not that segment looks like a version.
pub fn ensure_versioned(path: &str) -> Result<String> {
    let segments: Vec<&str> = path.split('/').collect();
    ensure!(
        !path.is_empty() && segments.iter().all(|s| !s.is_empty()),
        error::EmptySegmentSnafu { path }
    );
    ensure!(segments.len() >= 2, error::DatasetNameSnafu { path });

    if is_version(segments[segments.len() - 1]) {
        Ok(path.to_string())
    } else {
        Ok(format!("{}/{}", path, Local::now().format("%Y-%m-%d")))
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "Dataset path '{}' must have both a name and a version, e.g. 'ns/name/2024-07-26'",
            path
        ))]
        DatasetName { path: String },

        #[snafu(display("Dataset path '{}' has an empty segment", path))]
        EmptySegment { path: String },

        #[snafu(display("URI '{}' does not end in a version segment", uri))]
        InvalidVersion { uri: super::StepURI },

        #[snafu(display("URI '{}' has no path after the scheme", uri))]
        MissingPath { uri: String },

        #[snafu(display("URI '{}' is missing a 'scheme://' prefix", uri))]
        MissingScheme { uri: String },

        #[snafu(display("Unknown scheme in URI '{}': {}", uri, source))]
        UnknownScheme {
            uri: String,
            source: serde_plain::Error,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        for s in [
            "snapshot://test_namespace/test_dataset/2024-07-26",
            "table://a/b/c/latest",
        ] {
            let uri = StepURI::parse(s).unwrap();
            assert_eq!(uri.to_string(), s);
            assert_eq!(StepURI::parse(&uri.to_string()).unwrap(), uri);
        }
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(StepURI::parse("ftp://a/b/2024-07-26").is_err());
        assert!(StepURI::parse("no-scheme-here").is_err());
        assert!(StepURI::parse("snapshot://").is_err());
    }

    #[test]
    fn ordering_matches_textual_form() {
        let mut uris = vec![
            StepURI::parse("table://a/b/2024-01-01").unwrap(),
            StepURI::parse("snapshot://z/z/2024-01-01").unwrap(),
            StepURI::parse("snapshot://a/b/latest").unwrap(),
            StepURI::parse("snapshot://a/b/2024-01-02").unwrap(),
        ];
        uris.sort();
        let mut textual: Vec<String> = uris.iter().map(ToString::to_string).collect();
        let sorted = textual.clone();
        textual.sort();
        assert_eq!(textual, sorted);
    }

    #[test]
    fn version_tokens() {
        assert!(is_version("latest"));
        assert!(is_version("2024-07-26"));
        assert!(!is_version("2024-7-26"));
        assert!(!is_version("v1"));
        assert!(!is_version(""));
    }

    #[test]
    fn ensure_versioned_appends_date() {
        let versioned = ensure_versioned("ns/dataset").unwrap();
        let segments: Vec<&str> = versioned.split('/').collect();
        assert_eq!(segments.len(), 3);
        assert!(is_version(segments[2]));
    }

    #[test]
    fn ensure_versioned_keeps_existing_version() {
        assert_eq!(
            ensure_versioned("ns/dataset/2024-07-26").unwrap(),
            "ns/dataset/2024-07-26"
        );
        assert_eq!(ensure_versioned("ns/dataset/latest").unwrap(), "ns/dataset/latest");
    }

    #[test]
    fn ensure_versioned_rejects_single_segment() {
        assert!(ensure_versioned("dataset").is_err());
        assert!(ensure_versioned("2024-07-26").is_err());
        assert!(ensure_versioned("").is_err());
        assert!(ensure_versioned("a//b").is_err());
    }

    #[test]
    fn validate_version_requires_name_and_version() {
        assert!(StepURI::parse("snapshot://a/b/2024-07-26")
            .unwrap()
            .validate_version()
            .is_ok());
        assert!(StepURI::parse("snapshot://a/latest")
            .unwrap()
            .validate_version()
            .is_ok());
        assert!(StepURI::parse("snapshot://2024-07-26")
            .unwrap()
            .validate_version()
            .is_err());
        assert!(StepURI::parse("snapshot://a/b")
            .unwrap()
            .validate_version()
            .is_err());
    }
}
