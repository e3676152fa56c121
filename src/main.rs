use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use proctor_relay::api;
use proctor_relay::directory::RoomDirectory;
use proctor_relay::relay::RelayServer;
use proctor_relay::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("proctor_relay=info,warp=warn"));

    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> proctor_relay::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Arc::new(Config::from_env()?);
    let directory = RoomDirectory::new();
    let server = RelayServer::with_directory(directory.clone());

    let routes = api::routes(config.clone(), server, directory);
    let bind_address = config.bind_address();

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Proctor relay listening"
    );

    warp::serve(routes).run(bind_address).await;
    Ok(())
}
