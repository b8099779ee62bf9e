use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::ship::{ObjectStore, ObjectStoreBuilder};
use crate::backup::validate::validate_dir_exist_or_created;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, ErrorKind, IntoInnerError, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use validator::Validate;

/// Object store kept on a local or mounted filesystem
///
/// Every bucket is a directory directly under `root`, every object a file in it.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct FsStorageConfig {
    #[validate(custom(function = validate_dir_exist_or_created))]
    #[builder(into)]
    root: PathBuf,
}

impl ObjectStoreBuilder for FsStorageConfig {
    fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(FsObjectStore::new(&self.root)))
    }
}

#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }
}

impl ObjectStore for FsObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match std::fs::metadata(self.bucket_dir(bucket)) {
            Ok(md) => Ok(md.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket);
        tracing::debug!("Creating bucket directory {:?} (region {:?} ignored)", dir, region);
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Streams into a hidden temporary file next to the target and renames it
    /// onto `key` only once the whole body was written and synced.
    fn put_object(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64> {
        let dir = self.bucket_dir(bucket);
        let target = object_path(&dir, key)?;

        let tmp = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        let mut writer = BufWriter::new(tmp);
        let bytes = std::io::copy(body, &mut writer)?;
        let tmp = writer.into_inner().map_err(IntoInnerError::into_error)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target)
            .map_err(|e| e.error)
            .map_err(Error::from)
            .with_msg(format!("Moving upload onto {:?} failed", target))?;

        Ok(bytes)
    }
}

fn object_path(bucket_dir: &Path, key: &str) -> Result<PathBuf> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains('/')
        && !key.contains('\0');
    if !valid {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid object key {key:?}, keys live at the bucket root"),
        )
        .into());
    }
    Ok(bucket_dir.join(key))
}
