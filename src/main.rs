//! Creative Evolve - evolutionary improvement of design-agent tool docs

use creative_evolve::cli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (WARN level by default, use RUST_LOG=info for progress)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into())
        )
        .init();

    cli::run().await
}
