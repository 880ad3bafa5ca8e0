use tokio::signal;

use linkpulse::config::AppConfig;
use linkpulse::shortcode::AlphanumericShortcode;
use linkpulse::startup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            eprintln!("Please check your environment variables.");
            eprintln!("Required: DATABASE_URL");
            std::process::exit(1);
        }
    };

    let _guard = match startup::init_logging(&config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            eprintln!("Continuing with default logging configuration...");
            None
        }
    };

    let generator = AlphanumericShortcode;
    AlphanumericShortcode::warm_up(); // Warm up the RNG to avoid blocking later

    let store = startup::init_store(&config).await?;
    let kv = startup::init_kv(&config).await?;

    let runtime = startup::build_runtime(&config, store, kv, generator).await;
    let router = startup::build_router(&runtime, &config)?;

    let broker = runtime.state.broker.clone();
    startup::start_server(router, config.bind_addr(), broker, shutdown_signal()).await?;

    // Server drained; let the workers flush what is still buffered.
    startup::shutdown_workers(&runtime.state.click_queue, runtime.worker_handles).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    tracing::info!("Shutdown signal received");
}
