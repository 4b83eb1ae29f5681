use crate::{
  client::{ErrorReport, Invocation},
  InvocationContext, LambdaRuntimeApiClient, Report, Shim, ShimError,
};
use anyhow::{Context as _, Result};
use std::sync::Arc;
use tracing::Instrument;

/// Drives a [`Shim`] with events from the runtime API, one invocation at a time.
pub struct Runtime {
  shim: Arc<Shim>,
  client: LambdaRuntimeApiClient,
}

impl Runtime {
  pub fn new(shim: Shim, client: LambdaRuntimeApiClient) -> Self {
    Self {
      shim: Arc::new(shim),
      client,
    }
  }

  /// Start from a configuration that may have failed to load.
  /// A failure is reported to `/runtime/init/error` and returned.
  pub async fn configure(
    mut client: LambdaRuntimeApiClient,
    shim: Result<Shim>,
  ) -> Result<Self> {
    match shim {
      Ok(shim) => {
        tracing::info!(program = %shim.program.display(), "Starting shim");
        Ok(Self::new(shim, client))
      }
      Err(err) => {
        tracing::error!("Invalid configuration: {:#}", err);
        client.report_init_error(&ErrorReport::from(&err)).await?;
        Err(err)
      }
    }
  }

  /// Block the current task and handle invocations in a loop.
  /// Only returns if talking to the runtime API fails.
  pub async fn run(mut self) -> Result<()> {
    loop {
      let invocation = self.client.next_invocation().await?;
      self.run_once(invocation).await?;
    }
  }

  /// Handle a single invocation.
  ///
  /// The first signal from the shim is relayed as soon as it arrives,
  /// then the shim is awaited until the handler exits.
  /// If the handler exits without output nothing is reported,
  /// and the invocation is held open until its deadline.
  pub async fn run_once(&mut self, invocation: Invocation) -> Result<Option<Report>> {
    let span = tracing::info_span!("invocation", request_id = %invocation.request_id);
    self.handle(invocation).instrument(span).await
  }

  async fn handle(&mut self, invocation: Invocation) -> Result<Option<Report>> {
    let request_id = invocation.request_id.clone();
    let event = match invocation.event() {
      Ok(event) => event,
      Err(err) => {
        tracing::error!("{}", err);
        self.client.report_error(&request_id, &ErrorReport::from(&err)).await?;
        return Ok(None);
      }
    };

    let (context, signal) = InvocationContext::channel();
    let shim = self.shim.clone();
    let deadline = invocation.deadline;
    let trace_id = invocation.trace_id.clone();
    let handler = tokio::spawn(
      async move {
        shim
          .handle_with(&event, context, deadline, |command| {
            if let Some(trace_id) = trace_id {
              command.env("_X_AMZN_TRACE_ID", trace_id);
            }
          })
          .await
      }
      .in_current_span(),
    );

    let signaled = match signal.recv().await {
      Some(signal) => {
        self.client.signal(&request_id, &signal).await?;
        true
      }
      None => false,
    };

    let outcome: Result<Report, ShimError> = handler.await.context("Handler task panicked")?;
    match outcome {
      Ok(report) => {
        if !signaled {
          tracing::warn!("Leaving the invocation to the platform timeout");
          if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
          }
        }
        Ok(Some(report))
      }
      Err(err) => {
        tracing::error!("{}", err);
        if !signaled {
          self.client.report_error(&request_id, &ErrorReport::from(&err)).await?;
        }
        Ok(None)
      }
    }
  }
}
