use clap::Parser;
use tracing_subscriber::EnvFilter;

use arbor::server::Server;
use arbor::settings::Settings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    let settings = Settings::parse();
    let server = Server::new(settings)
        .await
        .expect("failed to initialize the controller");

    server.serve().await.expect("server error");
}
