use collaboard_sync::config::RelayConfig;
use collaboard_sync::relay::{self, RelayState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env();
    let state = RelayState::new(&config);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, client_buffer = config.client_buffer, "relay listening");
    relay::serve(listener, state).await.expect("server failed");
}
