use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use unilease_core::Config;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, value_parser, default_value = "/etc/unilease/unilease.toml")]
    pub config_file: PathBuf,

    /// How long to serve before shutting down, in seconds. Runs until
    /// Ctrl-C when omitted.
    #[clap(short, long)]
    pub duration: Option<u64>,
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    let config_contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&config_contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
