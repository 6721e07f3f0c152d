use clap::{Args, Parser};
use config::{CommonConfig, Config, ConfigError, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use rapidsms_relay::backbone::ChannelBackbone;
use rapidsms_relay::config::StaticResolver;
use rapidsms_relay::message::Message;
use rapidsms_relay::metrics_defs::ALL_METRICS;
use rapidsms_relay::{RelayError, RelayService};
use shared::metrics_defs::describe_all;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod config;
mod transport;

const STDIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "relayd", about = "Relay between a Vumi backbone and RapidSMS")]
enum CliCommand {
    /// Run the relay, bridging the backbone over stdin/stdout
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("relayd: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: RunArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;

    // Sentry must be set up before the runtime starts its threads
    let _sentry = init_logging(&config.common);
    init_metrics(config.common.metrics.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(run_async(config));
    // A blocking stdin read may still be parked on its thread
    rt.shutdown_timeout(STDIN_SHUTDOWN_TIMEOUT);
    result
}

fn init_logging(common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let default_level = common
        .logging
        .as_ref()
        .map_or("info", |logging| logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let guard = common
        .logging
        .as_ref()
        .and_then(|logging| logging.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    // Logs go to stderr, stdout carries backbone traffic
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(fmt)
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(metrics: Option<&MetricsConfig>) -> Result<(), CliError> {
    let Some(metrics) = metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
        .build(Some(&metrics.prefix))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    describe_all(ALL_METRICS);

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

async fn run_async(config: Config) -> Result<(), CliError> {
    let (outbound_tx, outbound_rx) = mpsc::channel(1024);
    let backbone = Arc::new(ChannelBackbone::new(outbound_tx, config.send_to));
    let resolver = Arc::new(StaticResolver::new(config.relay.settings.clone()));
    let service = RelayService::new(config.relay, resolver, backbone);

    let addr = service.start().await?;
    tracing::info!(%addr, "Starting rapidsms relay");

    run_bridge(
        service,
        outbound_rx,
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    )
    .await
}

/// Bridges the backbone over `input`/`output` until `input` ends or
/// `interrupt` resolves, then shuts down without dropping work: forwards
/// already started complete, open HTTP connections drain and every queued
/// outbound message is written.
async fn run_bridge<R, W, F>(
    service: RelayService,
    outbound: mpsc::Receiver<Message>,
    input: R,
    output: W,
    interrupt: F,
) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (deliveries_tx, deliveries_rx) = mpsc::channel(1024);

    let writer = tokio::spawn(transport::write_outbound(outbound, output));
    let reader = tokio::spawn(transport::read_deliveries(input, deliveries_tx));
    let mut consumer = {
        let service = service.clone();
        tokio::spawn(async move { service.run_consumer(deliveries_rx).await })
    };

    let interrupted = tokio::select! {
        _ = interrupt => true,
        joined = &mut consumer => {
            if let Err(e) = joined {
                tracing::error!(error = %e, "backbone consumer failed");
            }
            false
        }
    };

    if interrupted {
        tracing::info!("received shutdown signal");
        // Closing the delivery channel lets the consumer finish its forwards
        reader.abort();
        if let Err(e) = consumer.await {
            tracing::error!(error = %e, "backbone consumer failed");
        }
    }

    service.stop().await?;

    // Last sender of the outbound channel goes with the service; the writer
    // then flushes whatever is still queued and returns
    drop(service);
    match writer.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "outbound writer failed"),
    }
    Ok(())
}
