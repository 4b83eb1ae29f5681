//! Run a handler program against a local runtime API emulator.
//!
//! ```sh
//! cargo run --example local_invoke -- ./elasticsearch_client '{"query":"foo"}'
//! ```

use anyhow::{Context, Result};
use aws_lambda_process_shim::{LambdaRuntimeApiClient, Runtime, RuntimeApiEmulator, Shim};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt().init();

  let mut args = std::env::args().skip(1);
  let program = args.next().context("Usage: local_invoke <program> [event]")?;
  let event = match args.next() {
    Some(raw) => serde_json::from_str(&raw).context("Event is not valid JSON")?,
    None => serde_json::Value::Null,
  };

  let mut emulator = RuntimeApiEmulator::start().await?;
  let client = LambdaRuntimeApiClient::connect(emulator.address()).await?;
  tokio::spawn(Runtime::new(Shim::default().program(program), client).run());

  emulator.invoke(event);
  let outcome = emulator.next_outcome().await;
  println!("{outcome:#?}");
  Ok(())
}
