use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inputhub")]
#[command(author, version, about = "Raw input device manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List event devices with identity and capability counts
    #[command(visible_alias = "ls")]
    List {
        /// Directory holding the event nodes
        #[arg(long, default_value = inputhub::device::INPUT_DIR)]
        dir: PathBuf,
    },

    /// Open the configured adapters and log canonical device state
    Run {
        /// Config file (defaults to inputhub_config.json next to the executable)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Stop after this many propagation passes (runs until interrupted if omitted)
        #[arg(short, long)]
        frames: Option<u64>,

        /// Propagation passes per second
        #[arg(short, long, default_value_t = 60)]
        rate: u32,
    },
}
