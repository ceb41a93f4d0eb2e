mod cli;
mod duration;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dhtwatch_sdk::{
    termination_signal, CommandSampler, DataServer, Poller, Sampler, ServerConfig,
    ShutdownOrchestrator, SimulatedSampler,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use cli::Cli;
use settings::Settings;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli)?;

    // Initialize tracing. An explicit --log-level wins over RUST_LOG.
    let directives = match cli.log_level {
        Some(_) => settings.log_level.clone(),
        None => std::env::var(EnvFilter::DEFAULT_ENV)
            .unwrap_or_else(|_| settings.log_level.clone()),
    };
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log level: {}", directives))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        interval = ?settings.interval,
        channel = settings.channel,
        debug = settings.debug,
        "starting dhtwatch-server",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(settings))
}

async fn run(settings: Settings) -> Result<()> {
    let lifetime = CancellationToken::new();

    let poller = Poller::builder(sampler(&settings))
        .interval(settings.interval)
        .lifetime(lifetime.clone())
        .build();
    poller.start();

    let server_config = ServerConfig::builder()
        .listen_addr(settings.listen_addr.clone())
        .data_path(settings.data_path.clone())
        .header_read_timeout(settings.header_read_timeout)
        .build();

    let server = match DataServer::bind(server_config).await {
        Ok(server) => server,
        Err(e) => {
            lifetime.cancel();
            poller.stop().await;
            return Err(e)
                .with_context(|| format!("starting server on {}", settings.listen_addr));
        }
    };

    let handle = server.serve(poller.clone());
    tracing::info!(
        addr = %handle.local_addr(),
        path = %settings.data_path,
        "serving latest sensor reading",
    );

    ShutdownOrchestrator::builder(lifetime)
        .drain_timeout(settings.drain_timeout)
        .endpoint(handle)
        .poller(poller)
        .build()
        .run_until(termination_signal())
        .await;

    tracing::info!("dhtwatch-server stopped");

    Ok(())
}

fn sampler(settings: &Settings) -> Arc<dyn Sampler> {
    if settings.debug {
        tracing::info!("using simulated sensor");
        return Arc::new(SimulatedSampler::new());
    }

    let sampler = CommandSampler::builder()
        .program(&settings.command)
        .args(settings.command_args.iter().cloned())
        .channel(settings.channel)
        .timeout(settings.sample_timeout)
        .build();
    tracing::info!(
        command = %settings.command.display(),
        channel = sampler.channel(),
        "reading sensor through external program"
    );

    Arc::new(sampler)
}
