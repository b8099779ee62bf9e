//! Runs one backup cycle as three concurrent stages.
//!
//! ```text
//! source dir -> [Archiver] =link=> [Compressor] =link=> [Shipper] -> object store
//! ```
//!
//! Each stage runs on its own named thread and reports exactly one outcome. The
//! first failure raises the shared [`CancelSignal`] and aborts the links, so the
//! remaining stages wind down on their own while the caller gets the error.

use crate::backup::archive::ArchiveConfig;
use crate::backup::cancel::CancelSignal;
use crate::backup::compress::CompressorConfig;
use crate::backup::finish::Abort;
use crate::backup::link::{stream_link, LinkReader, LinkWriter, DEFAULT_CHUNK_SIZE, DEFAULT_LINK_CAPACITY};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::ship::Shipper;
use bon::Builder;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

const STAGE_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Stage {
    Archiver,
    Compressor,
    Shipper,
}

type Outcome = (Stage, Result<()>);

#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
pub struct Pipeline {
    #[builder(default)]
    #[getset(get_copy = "pub")]
    archive: ArchiveConfig,
    #[builder(default)]
    #[getset(get = "pub")]
    compressor: CompressorConfig,
    #[getset(get = "pub")]
    shipper: Shipper,
    #[builder(default = DEFAULT_LINK_CAPACITY)]
    #[getset(get_copy = "pub")]
    link_capacity: usize,
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    #[getset(get_copy = "pub")]
    chunk_size: usize,
    #[builder(skip)]
    live_stages: Arc<AtomicUsize>,
}

/// Keeps the live stage count accurate whichever way a stage thread ends.
struct LiveStageGuard(Arc<AtomicUsize>);

impl LiveStageGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveStageGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Pipeline {
    /// Number of stage threads, from any cycle, that have not exited yet.
    pub fn live_stages(&self) -> usize {
        self.live_stages.load(Ordering::SeqCst)
    }

    /// Archives `source`, compresses it and uploads it as `key`, all concurrently.
    ///
    /// Returns once every stage succeeded, or as soon as the failure that caused the
    /// cycle to fail is known. Stages still winding down are not waited for.
    pub fn run(&self, source: &Path, key: &str) -> Result<()> {
        tracing::info!("Starting pipeline for {:?} as {:?}", source, key);
        let cancel = CancelSignal::new();
        let (outcome_tx, outcome_rx) = sync_channel::<Outcome>(STAGE_COUNT);

        self.spawn_stages(source, key, &cancel, &outcome_tx)
            .inspect_err(|_| cancel.cancel())?;
        drop(outcome_tx);

        let res = await_outcomes(outcome_rx, &cancel);
        match &res {
            Ok(()) => tracing::info!("Pipeline for {:?} completed", key),
            Err(e) => tracing::error!("Pipeline for {:?} failed: {}", key, e),
        }
        res
    }

    fn spawn_stages(
        &self,
        source: &Path,
        key: &str,
        cancel: &CancelSignal,
        outcomes: &SyncSender<Outcome>,
    ) -> Result<()> {
        let (archive_tx, archive_rx) =
            stream_link(self.link_capacity, self.chunk_size, cancel.clone());
        let (compressed_tx, compressed_rx) =
            stream_link(self.link_capacity, self.chunk_size, cancel.clone());

        let archive = self.archive;
        let source = source.to_path_buf();
        self.spawn_stage(Stage::Archiver, outcomes, move || {
            run_archiver(archive, &source, archive_tx)
        })?;

        let compressor = self.compressor.clone();
        self.spawn_stage(Stage::Compressor, outcomes, move || {
            run_compressor(&compressor, archive_rx, compressed_tx)
        })?;

        let shipper = self.shipper.clone();
        let key = key.to_string();
        let cancel = cancel.clone();
        self.spawn_stage(Stage::Shipper, outcomes, move || {
            shipper.ship(compressed_rx, &key, &cancel).map(|_| ())
        })
    }

    fn spawn_stage<F>(&self, stage: Stage, outcomes: &SyncSender<Outcome>, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let outcomes = outcomes.clone();
        let guard = LiveStageGuard::new(self.live_stages.clone());
        std::thread::Builder::new()
            .name(stage.to_string().to_lowercase())
            .spawn(move || {
                let _guard = guard;
                tracing::debug!("{} stage started", stage);
                let outcome = body();
                if let Err(e) = &outcome {
                    tracing::debug!("{} stage stopped: {}", stage, e);
                }
                // The coordinator may already be gone after an earlier failure
                let _ = outcomes.send((stage, outcome));
            })
            .map_err(Error::from)
            .with_msg(format!("Spawning {stage} stage failed"))?;
        Ok(())
    }
}

fn run_archiver(config: ArchiveConfig, source: &Path, mut sink: LinkWriter) -> Result<()> {
    let archived = config.write_archive(source, &mut sink).map(|_| ());
    match archived {
        Ok(()) => Ok(sink.finish()?),
        Err(e) => {
            sink.abort(&e);
            Err(e)
        }
    }
}

fn run_compressor(
    config: &CompressorConfig,
    source: LinkReader,
    mut sink: LinkWriter,
) -> Result<()> {
    let compressed = config.compress_stream(source, &mut sink).map(|_| ());
    match compressed {
        Ok(()) => sink.finish().map_err(Error::transform),
        Err(e) => {
            sink.abort(&e);
            Err(e)
        }
    }
}

/// Waits for every stage to succeed or for the error that explains the failure.
///
/// Errors that only report a vanished neighbour are kept aside while the stage
/// that actually failed may still report.
fn await_outcomes(outcomes: Receiver<Outcome>, cancel: &CancelSignal) -> Result<()> {
    let mut succeeded = 0;
    let mut fallback = None;

    for (stage, outcome) in outcomes.iter() {
        match outcome {
            Ok(()) => {
                tracing::debug!("{} stage succeeded", stage);
                succeeded += 1;
                if succeeded == STAGE_COUNT {
                    return Ok(());
                }
            }
            Err(error) => {
                cancel.cancel();
                let error = Error::Stage {
                    stage,
                    error: Box::new(error),
                };
                if !error.is_secondary() {
                    return Err(error);
                }
                if fallback.is_none() {
                    fallback = Some(error);
                }
            }
        }
    }

    Err(fallback.unwrap_or(Error::StageLost))
}
