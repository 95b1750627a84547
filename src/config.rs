//! Process-wide configuration, taken from the environment once at startup
//! and passed down as an immutable context rather than re-read on every call.

use snafu::ResultExt;
use std::env;

/// Connection details for the S3-compatible object store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint_url: String,
    pub bucket: String,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            access_key: getenv("S3_ACCESS_KEY")?,
            secret_key: getenv("S3_SECRET_KEY")?,
            endpoint_url: getenv("S3_ENDPOINT_URL")?,
            bucket: getenv("S3_BUCKET_NAME")?,
        })
    }
}

/// The editor used for `--edit`, defaulting to vim.
pub fn editor() -> String {
    env::var("EDITOR").unwrap_or_else(|_| "vim".to_string())
}

/// Retrieve a variable that we expect to be set in the environment.
pub fn getenv(var: &str) -> Result<String> {
    env::var(var).context(error::EnvironmentSnafu { var })
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Missing environment variable '{}'", var))]
        Environment {
            var: String,
            source: std::env::VarError,
        },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
