//! Tally live-update gateway binary.

use std::sync::Arc;

use clap::Parser;
use tally_gateway::{create_router, AppState, Args, GatewayConfig};
use tally_notify::{
    start_processor, ChangeNotifier, JwtVerifier, PgChangeListener, SharedNotifier,
    SledTimestampStore,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line args
    let args = Args::parse();

    // Initialize tracing
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "tally_gateway={level},tally_notify={level},tower_http=info",
                    level = log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from(args);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        change_feed = config.database_url.is_some(),
        auth = config.jwt_secret.is_some(),
        "starting Tally gateway"
    );

    // Open the timestamp store
    let store = SledTimestampStore::open(config.status_store_path())?;
    let notifier = ChangeNotifier::shared(Arc::new(store), config.notifier_config());

    // Start the change feed
    let feed = start_processor(notifier.clone(), config.feed_config());

    let mut state = AppState::new(notifier.clone(), feed.clone(), config.clone());

    if let Some(listener_config) = config.listener_config() {
        listener_config.validate()?;
        let listener = PgChangeListener::new(listener_config, feed);
        state = state.with_listener(listener.status());
        listener.spawn();
    } else {
        warn!("no DATABASE_URL set, changes arrive only through the webhook");
    }

    if let Some(secret) = config.jwt_secret.as_deref() {
        state = state.with_verifier(Arc::new(JwtVerifier::with_secret_str(secret)));
    }

    // Create router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Gateway listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(notifier))
        .await?;

    info!("gateway shutdown complete");
    Ok(())
}

/// Wait for ctrl+c, then end open subscriber streams so connections can drain.
async fn shutdown_signal(notifier: SharedNotifier) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
    notifier.disconnect_all();
}
