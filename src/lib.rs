//! A custom lambda runtime that hands every event to an external executable.
//!
//! Each invocation spawns the handler program with the event's JSON text as
//! its only argument. The first chunk the program writes to stdout or stderr
//! completes the invocation; the exit code is only logged.
//!
//! # Examples
//! ```no_run
//! use aws_lambda_process_shim::{LambdaRuntimeApiClient, Runtime, Shim};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!   let shim = Shim::default().program("./elasticsearch_client");
//!   let client = LambdaRuntimeApiClient::start().await?;
//!   Runtime::new(shim, client).run().await
//! }
//! ```

mod client;
mod context;
mod error;
mod event;
mod runtime;
mod server;
mod shim;

pub use client::*;
pub use context::*;
pub use error::*;
pub use event::ChildEvent;
pub use runtime::*;
pub use server::*;
pub use shim::*;
