use clap::Parser;
use img3d::{Application, Config, telemetry};

/// Resolve once SIGTERM or Ctrl+C arrives. In-flight conversions finish before the server exits.
async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result.expect("Failed to install Ctrl+C handler");
            "Ctrl+C"
        }
        _ = terminate => "SIGTERM",
    };
    tracing::info!(signal = received, "Shutting down gracefully, waiting for in-flight requests");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // OTLP export goes over reqwest with rustls
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = img3d::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let shutdown = shutdown_signal();
    Application::new(config).await?.serve(shutdown).await
}
