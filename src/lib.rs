//! # etcd-ship
//!
//! Periodic etcd backups streamed straight to object storage.
//!
//! ## Features
//!
//! - **Snapshots**: Runs `etcdctl backup` into a private working directory
//! - **Streaming Pipeline**: Archiving, compression and upload run concurrently over bounded links
//! - **Compression**: XZ (LZMA) with optional parallel processing
//! - **Fail Fast**: The first failing stage cancels the others; a failed upload leaves no object
//! - **Bucket Provisioning**: Missing buckets are created and waited for
//! - **Scheduling**: Optional fixed repeat interval
//!
//! ## Quick Start
//!
//! ```no_run
//! use etcd_ship::backup::backup_config::BackupConfig;
//!
//! // Load configuration from YAML file
//! let config: BackupConfig = serde_yml::from_reader(std::fs::File::open("config.yml")?)?;
//!
//! // Run one backup cycle
//! config.start_loop(true)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
