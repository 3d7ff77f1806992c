use std::{fs, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use emufleet::{Fleet, FleetConfig};

#[derive(Parser)]
#[command(
    name = "emufleet",
    version,
    about = "Dispatch dynamic-analysis jobs across a fleet of Android emulators"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a batch of analyses, one emulator per fleet slot
    Run {
        /// File containing application paths, one per line
        applist: PathBuf,
        /// Folder receiving one result directory per application
        out_folder: PathBuf,
        /// Analysis script, invoked as `bash <script> <apk> <serial> <out_dir>`
        analysis_script: PathBuf,
        #[arg(long)]
        slots: Option<usize>,
        #[arg(long)]
        base_port: Option<u16>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Instrumentation-server installer run while building each
        /// baseline snapshot
        #[arg(long)]
        setup_script: Option<PathBuf>,
    },
    /// Delete the fleet's device images
    Teardown {
        #[arg(long)]
        slots: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    emufleet_util::init_tracing()?;

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Run {
            applist,
            out_folder,
            analysis_script,
            slots,
            base_port,
            image,
            timeout_secs,
            setup_script,
        } => {
            let mut cfg = FleetConfig::from_env();
            if let Some(slots) = slots {
                cfg.slot_count = slots;
            }
            if let Some(base_port) = base_port {
                cfg.base_console_port = base_port;
            }
            if let Some(image) = image {
                cfg.system_image = image;
            }
            if let Some(secs) = timeout_secs {
                cfg.job_timeout = Duration::from_secs(secs);
            }
            cfg.setup_script = setup_script;

            let jobs: Vec<String> = fs::read_to_string(&applist)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();

            Fleet::new(cfg)
                .run(jobs, &out_folder, &analysis_script)
                .await?;
        }
        Cmd::Teardown { slots } => {
            let mut cfg = FleetConfig::from_env();
            if let Some(slots) = slots {
                cfg.slot_count = slots;
            }
            Fleet::new(cfg).teardown_images().await?;
        }
    }
    Ok(())
}
