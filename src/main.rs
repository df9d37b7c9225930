#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "media_gateway=info".to_string()),
        )
        .init();

    if let Err(error) = media_gateway::run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}
