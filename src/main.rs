use imap_ntfy_bridge::bridge::Bridge;
use imap_ntfy_bridge::config::BridgeConfig;
use imap_ntfy_bridge::ledger::Ledger;
use imap_ntfy_bridge::mailbox::ImapConnector;
use imap_ntfy_bridge::notify::NtfyNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let ledger = Ledger::open(&config.database_path).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open ledger at {}: {e}", config.database_path);
        std::process::exit(1);
    });

    let notifier = NtfyNotifier::new(
        config.ntfy_topic.clone(),
        config.ntfy_title.clone(),
        config.ntfy_icon.clone(),
        config.ntfy_priority,
    );
    let connector = ImapConnector::new(&config);

    let mut bridge = Bridge::new(&config, connector, notifier, ledger);

    let shutdown = bridge.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.trigger();
        }
    });

    bridge.run().await?;
    Ok(())
}
