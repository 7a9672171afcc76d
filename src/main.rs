use tracing::info;

use heartbeat_server::{HeartbeatServer, ServerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let server = HeartbeatServer::bind(ServerConfig::default())
        .await
        .expect("Failed to start heartbeat server");

    server.run_with_signal().await;
    info!("Shutdown");
}
