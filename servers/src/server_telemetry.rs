use anyhow::Result;
use lib_telemetry::BroadcastHub;
use std::sync::Arc;
use tokio::signal;

mod telemetry_logic;
use telemetry_logic::{config, downstream, logger, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = dotenvy::dotenv();
    let config = config::load_config();
    logger::setup_logging(config.log_dir(), config.log_level())?;

    let descriptor = config.descriptor()?;
    log::info!(
        "Starting relay: port={}, consumerGroup={}, hub={}",
        config.port(),
        config.consumer_group(),
        descriptor
    );
    log::debug!("Effective configuration: {:?}", config);

    let hub = Arc::new(BroadcastHub::new());
    let mut relay = upstream::build_relay(&config, Arc::clone(&hub))?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let downstream_handle = tokio::spawn(downstream::run(
        config.port(),
        Arc::clone(&hub),
        config.static_dir().to_path_buf(),
        shutdown_tx.subscribe(),
    ));

    if let Err(e) = relay.start(&descriptor, config.consumer_group()).await {
        log::error!("Could not start the telemetry relay: {}", e);
        let _ = shutdown_tx.send(());
        let _ = downstream_handle.await;
        return Err(e.into());
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    relay.stop().await;
    let _ = shutdown_tx.send(());

    match downstream_handle.await {
        Ok(Err(e)) => log::error!("Downstream server failed: {}", e),
        Err(e) => log::error!("Downstream task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::warn!("Could not install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
