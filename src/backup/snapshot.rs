use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::validate::{validate_dir_exist, validate_file_exist};
use bon::Builder;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use validator::Validate;

static DEFAULT_SNAPSHOT_COMMAND: &str = "/usr/bin/etcdctl";
static DEFAULT_SNAPSHOT_ARG: &str = "backup";

/// External tool producing a consistent copy of the store's data directory
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SnapshotConfig {
    #[serde(default = "default_command")]
    #[builder(default = default_command(), into)]
    #[validate(custom(function = validate_file_exist))]
    command: PathBuf,
    #[serde(default = "default_args")]
    #[builder(default = default_args())]
    args: Vec<Arc<str>>,
    #[builder(into)]
    #[validate(custom(function = validate_dir_exist))]
    data_dir: PathBuf,
}

fn default_command() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_COMMAND)
}

fn default_args() -> Vec<Arc<str>> {
    vec![DEFAULT_SNAPSHOT_ARG.into()]
}

impl SnapshotConfig {
    fn command_line(&self, out_dir: &Path) -> Command {
        let mut command = Command::new(&self.command);
        command
            .args(self.args.iter().map(AsRef::<str>::as_ref))
            .arg(format!("--data-dir={}", self.data_dir.display()))
            .arg(format!("--backup-dir={}", out_dir.display()));
        command
    }

    /// Runs the snapshot tool so that it fills `out_dir`.
    ///
    /// A non-zero exit status or anything written to stderr fails the snapshot.
    pub fn take_snapshot(&self, out_dir: &Path) -> Result<()> {
        let mut command = self.command_line(out_dir);
        let printable = std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|s| s.to_string_lossy())
            .join(" ");
        tracing::info!("Taking snapshot: {}", printable);

        let output = command
            .output()
            .map_err(Error::from)
            .with_msg(format!("Starting snapshot command {:?} failed", self.command))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            return Err(Error::Snapshot {
                command: printable,
                status: output.status.to_string(),
                output: [stdout.trim(), stderr.trim()]
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .join("\n"),
            });
        }

        if !stdout.trim().is_empty() {
            tracing::debug!("Snapshot output:\n{}", stdout.trim());
        }
        Ok(())
    }
}
