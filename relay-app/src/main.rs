mod amqp;
mod logging;
mod runs;
mod socket;

use anyhow::Context;
use relay_correlator::ResponseCorrelator;
use relay_events::ThreadedSink;
use relay_memory::HttpHistorySource;
use relay_runtime::{load_config, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use amqp::AmqpConnector;
use socket::RuntimeSocket;

const DEFAULT_CONFIG_PATH: &str = "relay.yaml";

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    logging::init(config.log_filter());
    info!("Starting relay runtime for namespace {}", config.namespace);

    // Client responses can arrive as soon as the socket joins, so the
    // correlator exists before the runtime does.
    let correlator = ResponseCorrelator::new();
    let socket = RuntimeSocket::connect(&config, correlator.clone())?;
    if !socket.wait_for_connection(Duration::from_secs(config.connect_timeout_secs)) {
        warn!(
            "Socket not connected after {}s, events are sent once it reconnects",
            config.connect_timeout_secs
        );
    }

    let sink = ThreadedSink::spawn(socket.transport()).context("Failed to start event transport")?;
    let history = Arc::new(HttpHistorySource::new(
        config.runtime_endpoint.clone(),
        config.namespace.clone(),
        config.namespace_api_key.clone(),
    ));
    let runtime = Runtime::with_correlator(
        config,
        runs::builtin(),
        history,
        Arc::new(sink.sender()),
        correlator,
    );

    let scheduler = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let result = scheduler.block_on(async {
        let connector = Arc::new(AmqpConnector::new(runtime.config().amqp.url.clone()));
        let mut consumer = runtime.consumer(connector);

        let token = consumer.shutdown_token();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    token.cancel();
                }
                Err(e) => error!("Failed to listen for ctrl-c: {}", e),
            }
        });

        let served = runtime.serve(&mut consumer).await;
        if let Err(e) = &served {
            error!("Task consumer stopped: {}", e);
        }
        runtime.shutdown(&consumer).await?;
        served
    });

    drop(scheduler);
    // Emitters hold sink handles through the runtime.
    drop(runtime);
    sink.shutdown();
    socket.disconnect();

    result.context("Relay runtime failed")
}
