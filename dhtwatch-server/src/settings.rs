//! Layered runtime settings.
//!
//! Sources, lowest precedence first: built-in defaults, the optional config
//! file, `DHTWATCH_*` environment variables, then command-line flags.
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! interval = "5s"
//! channel = 5
//! command = "/opt/dht/rpi.py"
//! drain_timeout = "15s"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::cli::Cli;
use crate::duration;

const ENV_PREFIX: &str = "DHTWATCH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_addr: String,
    pub data_path: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    pub channel: u32,
    pub command: PathBuf,
    pub command_args: Vec<String>,
    #[serde(deserialize_with = "duration::deserialize")]
    pub sample_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub drain_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub header_read_timeout: Duration,
    pub debug: bool,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            data_path: "/data".to_string(),
            interval: dhtwatch_sdk::DEFAULT_INTERVAL,
            channel: 5,
            command: PathBuf::from("rpi.py"),
            command_args: Vec::new(),
            sample_timeout: dhtwatch_sdk::DEFAULT_SAMPLE_TIMEOUT,
            drain_timeout: dhtwatch_sdk::DEFAULT_DRAIN_TIMEOUT,
            header_read_timeout: Duration::from_secs(15),
            debug: false,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings for this process: config file, environment, then flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env(cli, environment())
    }

    fn load_with_env(cli: &Cli, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }
        builder = builder.add_source(env);
        builder = apply_flags(builder, cli)?;

        let settings: Settings = builder
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .with_context(|| match &cli.config {
                Some(path) => format!("invalid configuration in {}", path.display()),
                None => "invalid configuration".to_string(),
            })?;

        Ok(settings)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(" ")
        .with_list_parse_key("command_args")
}

fn apply_flags(
    builder: ConfigBuilder<config::builder::DefaultState>,
    cli: &Cli,
) -> Result<ConfigBuilder<config::builder::DefaultState>> {
    let mut builder = builder
        .set_override_option("interval", cli.interval.clone())?
        .set_override_option("channel", cli.tpin.map(i64::from))?
        .set_override_option(
            "command",
            cli.command.as_ref().map(|p| p.to_string_lossy().into_owned()),
        )?
        .set_override_option("listen_addr", cli.listen.clone())?
        .set_override_option("log_level", cli.log_level.clone())?;

    // --debug can only switch the simulated sensor on.
    if cli.debug {
        builder = builder.set_override("debug", true)?;
    }

    Ok(builder)
}
