use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rkbackup",
    version,
    about = "Take one lock-coordinated snapshot of the Xline store and exit"
)]
pub struct Cli {
    /// YAML config file; built-in defaults are used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
