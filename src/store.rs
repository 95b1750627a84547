//! Content-addressed access to the S3-compatible object store.
//!
//! Objects are keyed by their SHA-256 checksum, fanned out under two
//! two-character prefixes so that no single key prefix becomes a hot spot.
//! Uploads are idempotent since the key is the content hash.
//!
//! A local disk cache under `~/.cache/shelf` mirrors the store's layout;
//! downloads check it first and populate it on a miss, so repeated fetches
//! of the same content never touch the network.

use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use log::{debug, info};
use snafu::ResultExt;
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::runtime::Runtime;

use crate::config::StoreConfig;

/// A blocking client for the object store. The async SDK runs on a runtime
/// owned here; callers never see it.
pub struct ObjectStore {
    bucket: String,
    client: S3Client,
    runtime: Runtime,
}

impl ObjectStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let runtime = Runtime::new().context(error::RuntimeSnafu)?;
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "shelf-environment",
        );
        // The endpoint decides where requests really go; the region is only
        // here to satisfy the SDK.
        let sdk_config = runtime.block_on(
            aws_config::from_env()
                .region(Region::new("us-east-1"))
                .endpoint_url(&config.endpoint_url)
                .credentials_provider(credentials)
                .load(),
        );
        Ok(Self {
            bucket: config.bucket.clone(),
            client: S3Client::new(&sdk_config),
            runtime,
        })
    }

    /// Uploads a local file under its content key and mirrors it into the
    /// disk cache.
    pub fn put(&self, local: &Path, checksum: &str) -> Result<()> {
        let key = object_key(checksum);
        info!(
            "Uploading {} to s3://{}/{}",
            local.display(),
            self.bucket,
            key
        );

        let mut file = File::open(local).context(error::FileOpenSnafu { path: local })?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .context(error::FileReadSnafu { path: local })?;

        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(buffer))
                    .send(),
            )
            .context(error::PutObjectSnafu { key: key.as_str() })?;

        populate_cache(checksum, local)
    }

    /// Materializes the object with the given checksum at `dest`, copying
    /// from the disk cache when possible and downloading otherwise.
    pub fn get(&self, checksum: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
        }

        if let Some(cached) = cached_object(checksum) {
            debug!("Cache hit for {}", checksum);
            info!("Copying {} from local cache", dest.display());
            fs::copy(&cached, dest).context(error::FileWriteSnafu { path: dest })?;
            return Ok(());
        }

        let key = object_key(checksum);
        info!(
            "Downloading s3://{}/{} to {}",
            self.bucket,
            key,
            dest.display()
        );
        let response = self
            .runtime
            .block_on(
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            )
            .context(error::GetObjectSnafu { key: key.as_str() })?;
        let body = self
            .runtime
            .block_on(response.body.collect())
            .context(error::ReadObjectSnafu { key: key.as_str() })?
            .into_bytes();
        fs::write(dest, &body).context(error::FileWriteSnafu { path: dest })?;

        populate_cache(checksum, dest)
    }
}

/// Maps a checksum to its store key: `ab/cd/abcd...`.
pub fn object_key(checksum: &str) -> String {
    format!("{}/{}/{}", &checksum[..2], &checksum[2..4], checksum)
}

/// Root of the local disk cache, if we can find one.
fn cache_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("SHELF_CACHE_DIR") {
        return Some(PathBuf::from(dir));
    }
    home::home_dir().map(|h| h.join(".cache").join("shelf"))
}

/// Returns the cache path for a checksum if the object is already cached.
pub fn cached_object(checksum: &str) -> Option<PathBuf> {
    let path = cache_dir()?.join(object_key(checksum));
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

/// Copies a file into the cache, writing to a temporary name and renaming
/// into place so concurrent readers never observe a partial object.
fn populate_cache(checksum: &str, source: &Path) -> Result<()> {
    let dir = match cache_dir() {
        Some(dir) => dir,
        None => return Ok(()),
    };
    let path = dir.join(object_key(checksum));
    if path.exists() {
        return Ok(());
    }
    let parent = path.parent().unwrap_or(&dir);
    fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;

    let temp = NamedTempFile::new_in(parent).context(error::CacheTempSnafu)?;
    fs::copy(source, temp.path()).context(error::FileWriteSnafu { path: temp.path() })?;
    temp.persist(&path)
        .context(error::CachePersistSnafu { path: &path })?;
    debug!("Cached {} at {}", checksum, path.display());
    Ok(())
}

pub mod error {
    use aws_sdk_s3::error::SdkError;
    use aws_sdk_s3::operation::get_object::GetObjectError;
    use aws_sdk_s3::operation::put_object::PutObjectError;
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to persist cached object at '{}': {}", path.display(), source))]
        CachePersist {
            path: PathBuf,
            source: tempfile::PersistError,
        },

        #[snafu(display("Failed to create cache temp file: {}", source))]
        CacheTemp { source: io::Error },

        #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
        CreateDir { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to open '{}': {}", path.display(), source))]
        FileOpen { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to read '{}': {}", path.display(), source))]
        FileRead { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to write '{}': {}", path.display(), source))]
        FileWrite { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to download object '{}': {}", key, source))]
        GetObject {
            key: String,
            source: SdkError<GetObjectError>,
        },

        #[snafu(display("Failed to upload object '{}': {}", key, source))]
        PutObject {
            key: String,
            source: SdkError<PutObjectError>,
        },

        #[snafu(display("Failed to read body of object '{}': {}", key, source))]
        ReadObject {
            key: String,
            source: aws_smithy_http::byte_stream::error::Error,
        },

        #[snafu(display("Failed to start async runtime: {}", source))]
        Runtime { source: io::Error },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvVar;
    use std::fs;
    use tempfile::TempDir;

    const CHECKSUM: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    #[test]
    fn object_keys_fan_out() {
        assert_eq!(
            object_key(CHECKSUM),
            format!("df/fd/{}", CHECKSUM)
        );
    }

    #[test]
    fn cache_round_trip() {
        let cache = TempDir::new().unwrap();
        let _env = EnvVar::set("SHELF_CACHE_DIR", cache.path());

        let source_dir = TempDir::new().unwrap();
        let source = source_dir.path().join("file1.txt");
        fs::write(&source, "Hello, World!").unwrap();

        assert!(cached_object(CHECKSUM).is_none());
        populate_cache(CHECKSUM, &source).unwrap();

        let cached = cached_object(CHECKSUM).expect("object should be cached");
        assert_eq!(cached, cache.path().join(object_key(CHECKSUM)));
        assert_eq!(fs::read_to_string(&cached).unwrap(), "Hello, World!");
    }

    #[test]
    fn get_prefers_cache_over_network() {
        let cache = TempDir::new().unwrap();
        let _env = EnvVar::set("SHELF_CACHE_DIR", cache.path());

        let source_dir = TempDir::new().unwrap();
        let source = source_dir.path().join("file1.txt");
        fs::write(&source, "Hello, World!").unwrap();
        populate_cache(CHECKSUM, &source).unwrap();

        // The endpoint is unroutable; a cache hit never contacts it.
        let store = ObjectStore::new(&StoreConfig {
            access_key: "justtesting".to_string(),
            secret_key: "justtesting".to_string(),
            endpoint_url: "http://127.0.0.1:1".to_string(),
            bucket: "test".to_string(),
        })
        .unwrap();

        let dest = source_dir.path().join("restored.txt");
        store.get(CHECKSUM, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "Hello, World!");
    }
}
