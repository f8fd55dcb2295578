//! Main entry point for the stratum server daemon.

use std::env;
use std::path::PathBuf;
use std::process;

use corvid_stratum::{config::Config, daemon::Daemon, tracing};

const DEFAULT_CONFIG: &str = "corvid-stratum.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let config_path = match args.get(1).map(String::as_str) {
        Some("-h") | Some("--help") => {
            eprintln!("Usage: stratumd [config.toml]");
            eprintln!();
            eprintln!("Runs the solo-mining stratum server described by the config");
            eprintln!("file (default: ./{}).", DEFAULT_CONFIG);
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  RUST_LOG    Log filter override (e.g. corvid_stratum=debug)");
            process::exit(0);
        }
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(DEFAULT_CONFIG),
    };

    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    tracing::init(config.debug, config.log_file.as_deref());

    let daemon = Daemon::new(config);
    daemon.run().await
}
