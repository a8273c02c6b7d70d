//! Configuration for trackerd.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// trackerd - Overmesh bootstrap tracker
#[derive(Parser, Debug, Clone)]
#[command(name = "trackerd")]
#[command(about = "Overmesh bootstrap tracker: rendezvous point for overlay discovery")]
pub struct Config {
    /// State directory holding persistent-storage.data
    #[arg(long, default_value = ".")]
    pub statedir: PathBuf,

    /// Address to bind the UDP endpoint to
    #[arg(long, default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// UDP port to listen on
    #[arg(long, default_value = "6421")]
    pub port: u16,

    /// Suppress the periodic statistics and peer lines on stdout
    #[arg(long)]
    pub silent: bool,

    /// Profile the engine thread (not supported in this build)
    #[arg(long)]
    pub profiler: bool,

    /// Periodically dump memory usage (not supported in this build)
    #[arg(long)]
    pub memory_dump: bool,
}

impl Config {
    /// Validate configuration beyond what clap checks.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if !self.statedir.exists() {
            anyhow::bail!("state directory {} does not exist", self.statedir.display());
        }
        Ok(())
    }

    pub fn storage_path(&self) -> PathBuf {
        self.statedir.join("persistent-storage.data")
    }
}
