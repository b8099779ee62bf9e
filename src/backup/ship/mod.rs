//! Delivery of the compressed archive to object storage.
//!
//! [`ObjectStore`] is the storage capability the pipeline needs: existence check,
//! creation, existence wait, and a single streaming upload that is either fully
//! visible under its key or not at all. [`Shipper`] provisions the bucket on demand
//! and streams one object per cycle.

pub mod fs;

use crate::backup::cancel::CancelSignal;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::validate::{validate_bucket_name, validate_region};
use bon::Builder;
use derive_more::From;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::{BufRead, Read};
use std::result;
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationErrors};

/// Existence checks issued after creating a bucket before giving up
static DEFAULT_BUCKET_WAIT_ATTEMPTS: u32 = 20;
/// Pause between two existence checks
static DEFAULT_BUCKET_WAIT_DELAY: Duration = Duration::from_secs(5);

/// Storage capability used by the shipper.
///
/// `put_object` must never leave a partially written object visible under `key`:
/// the object appears only once `body` has been read to its end successfully.
pub trait ObjectStore: Send + Sync + Debug {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    fn create_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    /// Blocks until `bucket` is visible, polling `bucket_exists`.
    ///
    /// Stores with their own consistency-wait primitive should override this.
    fn wait_until_bucket_exists(
        &self,
        bucket: &str,
        wait: &BucketWaitConfig,
        cancel: &CancelSignal,
    ) -> Result<()> {
        for attempt in 1..=wait.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.bucket_exists(bucket)? {
                tracing::debug!("Bucket {:?} visible after {} checks", bucket, attempt);
                return Ok(());
            }
            if attempt < wait.max_attempts && !cancel.sleep(wait.delay) {
                return Err(Error::Cancelled);
            }
        }
        Err(Error::BucketWaitTimeout {
            bucket: bucket.to_string(),
            attempts: wait.max_attempts,
        })
    }

    /// Streams `body` into `bucket/key`, returning the number of bytes stored.
    fn put_object(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64>;
}

/// Bounded polling applied after a bucket was created
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Validate, Builder, CopyGetters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct BucketWaitConfig {
    #[serde(default = "default_wait_attempts")]
    #[builder(default = DEFAULT_BUCKET_WAIT_ATTEMPTS)]
    #[validate(range(min = 1))]
    max_attempts: u32,
    #[serde(default = "default_wait_delay", with = "humantime_serde")]
    #[builder(default = DEFAULT_BUCKET_WAIT_DELAY)]
    delay: Duration,
}

fn default_wait_attempts() -> u32 {
    DEFAULT_BUCKET_WAIT_ATTEMPTS
}

fn default_wait_delay() -> Duration {
    DEFAULT_BUCKET_WAIT_DELAY
}

impl Default for BucketWaitConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Where archives are shipped to
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct Destination {
    #[validate(custom(function = validate_bucket_name))]
    #[builder(into)]
    bucket: Arc<str>,
    #[validate(custom(function = validate_region))]
    #[builder(into)]
    region: Arc<str>,
}

#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "storage_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StorageConfig {
    Filesystem(fs::FsStorageConfig),
}

impl Validate for StorageConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            StorageConfig::Filesystem(inner) => inner.validate(),
        }
    }
}

pub trait ObjectStoreBuilder {
    fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>>;
}

impl ObjectStoreBuilder for StorageConfig {
    fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            StorageConfig::Filesystem(fs) => fs.build_object_store(),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_object_store")
    }
}

/// Final stage of the pipeline: provisions the bucket and uploads the stream
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct Shipper {
    store: Arc<dyn ObjectStore>,
    destination: Destination,
    #[builder(default)]
    bucket_wait: BucketWaitConfig,
}

impl Shipper {
    /// Makes sure the destination bucket exists, creating it and waiting for it if needed.
    ///
    /// Check-then-create is not atomic across processes; a concurrent creator is
    /// tolerated because creating an existing bucket succeeds.
    pub fn ensure_bucket(&self, cancel: &CancelSignal) -> Result<()> {
        let bucket = self.destination.bucket.as_ref();
        tracing::info!("Verifying bucket {:?} exists", bucket);

        let provision = || -> Result<()> {
            if self.store.bucket_exists(bucket)? {
                return Ok(());
            }
            tracing::info!(
                "Bucket {:?} missing, creating it in {:?}",
                bucket,
                self.destination.region
            );
            self.store.create_bucket(bucket, &self.destination.region)?;
            self.store
                .wait_until_bucket_exists(bucket, &self.bucket_wait, cancel)
        };

        provision().map_err(|e| Error::Provisioning {
            bucket: bucket.to_string(),
            error: Box::new(e),
        })
    }

    /// Uploads everything read from `source` as `key`.
    ///
    /// Nothing is sent to the store before the first byte of `source` is available,
    /// so a stream that fails before producing data never touches the bucket.
    pub fn ship<R: BufRead>(&self, mut source: R, key: &str, cancel: &CancelSignal) -> Result<u64> {
        source
            .fill_buf()
            .map_err(Error::from)
            .with_msg("Waiting for the first archive bytes failed")?;

        self.ensure_bucket(cancel)?;

        let bucket = self.destination.bucket.as_ref();
        tracing::info!("Uploading {:?} to bucket {:?}", key, bucket);
        let bytes = self
            .store
            .put_object(bucket, key, &mut source)
            .map_err(|e| Error::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                error: Box::new(e),
            })?;
        tracing::info!("Uploaded {} bytes to {}/{}", bytes, bucket, key);
        Ok(bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory store recording every call it receives
    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub buckets: Mutex<HashSet<String>>,
        pub objects: Mutex<HashMap<(String, String), Vec<u8>>>,
        pub calls: Mutex<Vec<String>>,
        /// Number of existence checks answering `false` after a creation
        pub invisible_checks: Mutex<u32>,
        /// Fail the upload after reading this many bytes
        pub fail_upload_after: Option<usize>,
    }

    impl MemoryStore {
        pub fn with_bucket(bucket: &str) -> Self {
            let store = Self::default();
            store.buckets.lock().unwrap().insert(bucket.to_string());
            store
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
        }
    }

    impl ObjectStore for MemoryStore {
        fn bucket_exists(&self, bucket: &str) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("bucket_exists {bucket}"));
            let mut invisible = self.invisible_checks.lock().unwrap();
            let exists = self.buckets.lock().unwrap().contains(bucket);
            if exists && *invisible > 0 {
                *invisible -= 1;
                return Ok(false);
            }
            Ok(exists)
        }

        fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create_bucket {bucket} {region}"));
            self.buckets.lock().unwrap().insert(bucket.to_string());
            Ok(())
        }

        fn put_object(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("put_object {bucket} {key}"));
            let mut data = Vec::new();
            match self.fail_upload_after {
                Some(limit) => {
                    body.take(limit as u64).read_to_end(&mut data)?;
                    return Err(std::io::Error::other("connection reset").into());
                }
                None => body.read_to_end(&mut data)?,
            };
            let len = data.len() as u64;
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data);
            Ok(len)
        }
    }

    fn fast_wait() -> BucketWaitConfig {
        BucketWaitConfig::builder()
            .max_attempts(5)
            .delay(Duration::from_millis(1))
            .build()
    }

    fn shipper(store: Arc<MemoryStore>) -> Shipper {
        Shipper::builder()
            .store(store)
            .destination(
                Destination::builder()
                    .bucket("test-bucket")
                    .region("us-west-2")
                    .build(),
            )
            .bucket_wait(fast_wait())
            .build()
    }

    #[test]
    fn test_bucket_wait_config_defaults() {
        let wait: BucketWaitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(wait, BucketWaitConfig::default());
        assert_eq!(wait.max_attempts(), 20);
        assert_eq!(wait.delay(), Duration::from_secs(5));

        let wait: BucketWaitConfig =
            serde_json::from_str(r#"{"max_attempts":3,"delay":"250ms"}"#).unwrap();
        assert_eq!(wait.delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_ship_to_existing_bucket_is_idempotent() {
        let store = Arc::new(MemoryStore::with_bucket("test-bucket"));
        let shipper = shipper(store.clone());
        let cancel = CancelSignal::new();

        shipper.ship(&b"first"[..], "one.tar.xz", &cancel).unwrap();
        shipper.ship(&b"second"[..], "two.tar.xz", &cancel).unwrap();

        assert!(!store.calls().iter().any(|c| c.starts_with("create_bucket")));
        assert_eq!(store.object("test-bucket", "two.tar.xz").unwrap(), b"second");
    }

    #[test]
    fn test_ship_creates_missing_bucket_and_waits() {
        let store = Arc::new(MemoryStore::default());
        *store.invisible_checks.lock().unwrap() = 2;
        let shipper = shipper(store.clone());

        let bytes = shipper
            .ship(&b"payload"[..], "k.tar.xz", &CancelSignal::new())
            .unwrap();
        assert_eq!(bytes, 7);

        let calls = store.calls();
        assert_eq!(calls[0], "bucket_exists test-bucket");
        assert_eq!(calls[1], "create_bucket test-bucket us-west-2");
        // two invisible checks, then the bucket shows up
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("bucket_exists")).count(),
            4
        );
        assert_eq!(calls.last().unwrap(), "put_object test-bucket k.tar.xz");

        // second run sees the bucket straight away
        shipper
            .ship(&b"payload"[..], "k2.tar.xz", &CancelSignal::new())
            .unwrap();
        assert_eq!(
            store
                .calls()
                .iter()
                .filter(|c| c.starts_with("create_bucket"))
                .count(),
            1
        );
    }

    #[test]
    fn test_bucket_wait_gives_up() {
        let store = Arc::new(MemoryStore::default());
        *store.invisible_checks.lock().unwrap() = 100;
        let shipper = shipper(store.clone());

        let err = shipper
            .ship(&b"payload"[..], "k.tar.xz", &CancelSignal::new())
            .unwrap_err();
        match err {
            Error::Provisioning { bucket, error } => {
                assert_eq!(bucket, "test-bucket");
                assert!(matches!(
                    *error,
                    Error::BucketWaitTimeout { attempts: 5, .. }
                ));
            }
            other => panic!("Expected Provisioning, got {other:?}"),
        }
        assert!(!store.calls().iter().any(|c| c.starts_with("put_object")));
    }

    #[test]
    fn test_bucket_wait_observes_cancel() {
        let store = MemoryStore::default();
        *store.invisible_checks.lock().unwrap() = 100;
        store.buckets.lock().unwrap().insert("b".into());
        let cancel = CancelSignal::new();
        cancel.cancel();

        let err = store
            .wait_until_bucket_exists("b", &BucketWaitConfig::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_failed_upload_leaves_no_object() {
        let store = Arc::new(MemoryStore {
            fail_upload_after: Some(3),
            ..MemoryStore::with_bucket("test-bucket")
        });
        let shipper = shipper(store.clone());

        let err = shipper
            .ship(&b"payload"[..], "k.tar.xz", &CancelSignal::new())
            .unwrap_err();
        assert!(matches!(err, Error::Upload { .. }));
        assert!(store.object("test-bucket", "k.tar.xz").is_none());
    }

    #[test]
    fn test_failing_source_never_touches_store() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("upstream gone"))
            }
        }

        let store = Arc::new(MemoryStore::with_bucket("test-bucket"));
        let shipper = shipper(store.clone());

        let err = shipper
            .ship(
                std::io::BufReader::new(Broken),
                "k.tar.xz",
                &CancelSignal::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("upstream gone"));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_destination_validation() {
        let ok = Destination::builder()
            .bucket("etcd-backups")
            .region("us-west-2")
            .build();
        assert!(ok.validate().is_ok());

        let bad = Destination::builder()
            .bucket("Etcd_Backups")
            .region("")
            .build();
        assert!(bad.validate().is_err());
    }
}
