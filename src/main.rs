use anyhow::Result;
use aws_lambda_process_shim::{LambdaRuntimeApiClient, Runtime, Shim};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_ansi(false)
    .without_time()
    .init();

  let client = LambdaRuntimeApiClient::start().await?;
  Runtime::configure(client, Shim::from_env()).await?.run().await
}
