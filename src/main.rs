use anyhow::Context;
use clap::Parser;
use gatekeeper::config::Config;
use gatekeeper::publisher::TokenPublisher;
use gatekeeper::server::Server;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about = "Secure request pipeline service")]
struct Args {
    /// Load configuration from a JSON file instead of the environment
    #[arg(long)]
    config: Option<String>,

    /// Also run the token publisher gRPC service
    #[arg(long)]
    publisher: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    if args.publisher {
        let grpc_addr = config
            .grpc_bind_address
            .parse()
            .context("invalid grpc bind address")?;
        let publisher = TokenPublisher::new(config.clone())?;
        tokio::spawn(async move {
            tracing::info!("token publisher serving on {}", grpc_addr);
            if let Err(err) = tonic::transport::Server::builder()
                .add_service(publisher.into_service())
                .serve(grpc_addr)
                .await
            {
                tracing::error!(error = %err, "token publisher exited");
            }
        });
    }

    let server = Server::new(config).await?;
    server.run().await
}
