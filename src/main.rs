use beacon::config::Config;
use beacon::server::listener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load();
    if cfg.document_root.is_none() {
        tracing::warn!("No document_root configured, every request will 404");
    }

    listener::run(&cfg).await
}
