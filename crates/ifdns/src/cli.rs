use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, name = "ifdns", about = "Recursive DNS front-end with per-interface policy routing")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "PATH", default_value = "./config.yaml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}
