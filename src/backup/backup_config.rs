use crate::backup::archive::ArchiveConfig;
use crate::backup::compress::CompressorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::pipeline::Pipeline;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::ship::{
    BucketWaitConfig, Destination, ObjectStore, ObjectStoreBuilder, Shipper, StorageConfig,
};
use crate::backup::snapshot::SnapshotConfig;
use crate::backup::validate::validate_writable_dir;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::DirBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{error, info};
use validator::Validate;

#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[validate(nested)]
    pub snapshot: SnapshotConfig,
    #[validate(nested)]
    pub destination: Destination,
    #[validate(nested)]
    pub storage: StorageConfig,
    #[serde(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    #[validate(nested)]
    pub bucket_wait: BucketWaitConfig,
    #[serde(default, with = "humantime_serde")]
    pub repeat_interval: Option<Duration>,
    #[validate(custom(function = validate_writable_dir))]
    pub temp_dir: Option<PathBuf>,
}

static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
static SNAPSHOT_DIR_NAME: &str = "data";

impl FileExtProvider for BackupConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()))
                .chain(self.compressor.file_ext().iter())
                .join(".")
                .into(),
        )
    }
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl BackupConfig {
    /// Name of the object shipped for a cycle started at `dt`, e.g. `2024-01-01T00:00:00Z.tar.xz`
    pub fn object_key(&self, dt: DateTime<Utc>) -> String {
        format!(
            "{}.{}",
            timestamp(dt),
            self.file_ext().unwrap_or("".into())
        )
    }

    pub fn pipeline(&self, store: Arc<dyn ObjectStore>) -> Pipeline {
        let shipper = Shipper::builder()
            .store(store)
            .destination(self.destination.clone())
            .bucket_wait(self.bucket_wait)
            .build();
        Pipeline::builder()
            .archive(self.archive)
            .compressor(self.compressor.clone())
            .shipper(shipper)
            .build()
    }

    fn create_work_dir(&self, now: DateTime<Utc>) -> Result<TempDir> {
        let prefix = format!("{}-", timestamp(now));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.temp_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(Error::from)
        .with_msg("Creating cycle working directory failed")
    }

    /// Takes one snapshot and ships it, returning the key it was stored under.
    ///
    /// The local working directory is removed when the cycle ends, whatever the outcome.
    pub fn run_cycle(&self, pipeline: &Pipeline, now: DateTime<Utc>) -> Result<String> {
        let work_dir = self.create_work_dir(now)?;
        let data_dir = work_dir.path().join(SNAPSHOT_DIR_NAME);
        create_private_dir(&data_dir)?;

        self.snapshot.take_snapshot(&data_dir)?;

        let key = self.object_key(now);
        pipeline.run(&data_dir, &key)?;
        Ok(key)
    }

    /// Runs a first cycle right away, then one every `repeat_interval` if set.
    ///
    /// Without an interval, or with `once`, returns the outcome of the single cycle.
    /// Otherwise a failed cycle is logged and the loop goes on.
    pub fn start_loop(&self, once: bool) -> Result<()> {
        let store = self.storage.build_object_store()?;
        let pipeline = self.pipeline(store);
        let cycle = |now: DateTime<Utc>| {
            info!("Trying to create backup...");
            self.run_cycle(&pipeline, now)
                .inspect(|key| {
                    info!(
                        "Shipped backup {:?} to bucket {:?}",
                        key,
                        self.destination.bucket()
                    )
                })
                .with_msg(format!("Backup cycle started at {} failed", timestamp(now)))
        };

        let Some(interval) = self.repeat_interval.filter(|_| !once) else {
            return cycle(Utc::now()).map(|_| ());
        };

        loop {
            let started = Instant::now();
            if let Err(e) = cycle(Utc::now()) {
                error!("{e}");
            }

            let remaining = interval.saturating_sub(started.elapsed());
            let next = TimeDelta::from_std(remaining)
                .map(|delta| timestamp(Utc::now() + delta))
                .unwrap_or_else(|_| "a distant future".to_string());
            info!("Next execution will be at {} ({:?} from now)", next, remaining);
            std::thread::sleep(remaining);
        }
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(Error::from)
        .with_msg(format!("Creating snapshot directory {:?} failed", dir))
}
