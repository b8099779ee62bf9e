use clap::Parser;
use etcd_ship::backup::backup_config::BackupConfig;
use etcd_ship::backup::result_error::error::Error;
use etcd_ship::backup::result_error::WithMsg;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info};
use validator::Validate;

/// Snapshot etcd and stream the compressed archive to object storage
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    /// Run a single cycle even if a repeat interval is configured
    #[arg(long)]
    once: bool,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = File::open(&args.config)
        .map_err(Error::from)
        .and_then(|f| {
            serde_yml::from_reader::<_, BackupConfig>(f)
                .map_err(Error::from)
                .with_msg(format!("Parse YAML config failed: {:?}", &args.config))
        })
        .and_then(|bc| {
            bc.validate()
                .map_err(Error::from)
                .map(|_| bc)
                .with_msg(format!("Config validation failed: {:?}", &args.config))
        })
        .and_then(|bc| bc.start_loop(args.once));

    match res {
        Ok(_) => info!("Backup finished"),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
