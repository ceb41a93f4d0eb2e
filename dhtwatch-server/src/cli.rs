use std::path::PathBuf;

use clap::Parser;

/// Serve the latest DHT11 temperature and humidity reading over HTTP.
#[derive(Parser, Debug, Default)]
#[command(name = "dhtwatch-server", version, about)]
pub struct Cli {
    /// Path to a configuration file (TOML, YAML or JSON).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use a simulated sensor instead of running the sensor program.
    #[arg(long)]
    pub debug: bool,

    /// Time between sensor reads (e.g., "5s", "500ms", or whole seconds).
    #[arg(short, long)]
    pub interval: Option<String>,

    /// BCM GPIO data pin the DHT11 sensor is wired to.
    #[arg(long)]
    pub tpin: Option<u32>,

    /// Sensor program to run; it receives the pin number as its last argument.
    #[arg(long)]
    pub command: Option<PathBuf>,

    /// Address to serve on (e.g., "0.0.0.0:8080").
    #[arg(long)]
    pub listen: Option<String>,

    /// Logging filter (trace, debug, info, warn, error, or a RUST_LOG directive).
    #[arg(long)]
    pub log_level: Option<String>,
}
