use anyhow::Result;
use lib_common::loggers::setup_logging;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod rcstream_logic;
use rcstream_logic::{config, routes};

const APP_NAME: &str = "server_rcstream";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let stream_config = config.stream_config();
    stream_config.validate()?;

    if let Some(path) = setup_logging(stream_config.log_dir.as_deref(), &stream_config.log_level, APP_NAME)? {
        log::info!("Logging to {}", path.display());
    }

    let counter = Arc::new(routes::EditCounter::new(config.counts_path()));
    let routes = routes::build_routes(config.watch_categories(), Arc::clone(&counter));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    lib_common::start_with_shutdown(routes, stream_config, shutdown).await?;

    match counter.save().await {
        Ok(()) => log::info!("Edit counts saved to {}: {:?}", counter.path().display(), counter.counts()),
        Err(e) => log::error!("Failed to save edit counts to {}: {:#}", counter.path().display(), e),
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
