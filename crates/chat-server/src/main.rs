//! Relay chat server
//!
//! Text-protocol instant messaging relay. Clients connect over TCP,
//! authenticate with HELLO or REGISTER, and exchange broadcast, private
//! and group messages. Undeliverable direct messages are archived and
//! replayed on the recipient's next login.
//!
//! # Startup flow
//!
//! 1. Load configuration from environment
//! 2. Load the profanity filter (built-in list or `RELAY_FORBIDDEN_WORDS_FILE`)
//! 3. Build the user directory, message archive and dispatcher
//! 4. Bind the TCP listener and run the accept loop
//! 5. Wait for shutdown signal

use std::sync::Arc;

use chat_server::archive::InMemoryArchive;
use chat_server::config::Config;
use chat_server::directory::InMemoryDirectory;
use chat_server::dispatcher::Dispatcher;
use chat_server::filter::ProfanityFilter;
use chat_server::net;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting relay chat server");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        tick_interval_ms = config.tick_interval.as_millis(),
        preauth_idle_timeout_ms = config.preauth_idle_timeout.as_millis(),
        authed_idle_timeout_ms = config.authed_idle_timeout.as_millis(),
        "Configuration loaded successfully"
    );

    let filter = match &config.forbidden_words_file {
        Some(path) => ProfanityFilter::from_file(path).map_err(|e| {
            error!(error = %e, path = %path.display(), "Failed to load forbidden words file");
            e
        })?,
        None => ProfanityFilter::default(),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(InMemoryDirectory::new()),
        Arc::new(InMemoryArchive::new()),
        filter,
        config.surveillance_identity.clone(),
    ));

    // Bind before spawning to fail fast on bind errors.
    let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Failed to bind listener");
        e
    })?;

    let shutdown_token = CancellationToken::new();
    let serve_token = shutdown_token.clone();
    let serve_config = Arc::new(config);
    let serve_dispatcher = Arc::clone(&dispatcher);
    let server = tokio::spawn(async move {
        if let Err(e) = net::serve(listener, serve_dispatcher, serve_config, serve_token).await {
            error!(error = %e, "Accept loop failed");
        }
    });

    info!("Relay chat server running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    shutdown_token.cancel();
    if let Err(e) = server.await {
        error!(error = %e, "Accept loop task failed to join");
    }

    info!("Relay chat server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
