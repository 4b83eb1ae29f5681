use tokio::sync::oneshot;

/// A terminal signal for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
  Succeed(String),
  Fail(String),
}

impl Signal {
  pub fn message(&self) -> &str {
    match self {
      Self::Succeed(msg) | Self::Fail(msg) => msg,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, Self::Succeed(_))
  }
}

/// The completion handle of a single invocation.
/// Both [`Self::succeed`] and [`Self::fail`] consume the context,
/// so an invocation can be signaled at most once.
#[derive(Debug)]
pub struct InvocationContext(oneshot::Sender<Signal>);

/// The runtime side of an [`InvocationContext`].
/// Resolves to `None` if the context was dropped without a signal.
#[derive(Debug)]
pub struct SignalReceiver(oneshot::Receiver<Signal>);

impl InvocationContext {
  /// Create a context and the receiver its signal is delivered to.
  pub fn channel() -> (Self, SignalReceiver) {
    let (tx, rx) = oneshot::channel();
    (Self(tx), SignalReceiver(rx))
  }

  pub fn succeed(self, message: impl Into<String>) {
    self.signal(Signal::Succeed(message.into()))
  }

  pub fn fail(self, error: impl Into<String>) {
    self.signal(Signal::Fail(error.into()))
  }

  pub(crate) fn signal(self, signal: Signal) {
    if let Err(signal) = self.0.send(signal) {
      tracing::warn!(?signal, "Runtime stopped listening before the signal arrived");
    }
  }
}

impl SignalReceiver {
  pub async fn recv(self) -> Option<Signal> {
    self.0.await.ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn delivers_the_signal() {
    let (ctx, rx) = InvocationContext::channel();
    ctx.succeed("stdout: ok");
    assert_eq!(rx.recv().await, Some(Signal::Succeed("stdout: ok".into())));
  }

  #[tokio::test]
  async fn dropped_context_resolves_to_none() {
    let (ctx, rx) = InvocationContext::channel();
    drop(ctx);
    assert_eq!(rx.recv().await, None);
  }

  #[tokio::test]
  async fn failing_after_the_runtime_is_gone_does_not_panic() {
    let (ctx, rx) = InvocationContext::channel();
    drop(rx);
    ctx.fail("Something went wrong");
  }
}
