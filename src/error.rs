use std::path::PathBuf;
use thiserror::Error;

/// Errors that end an invocation without a terminal signal from the child's output.
#[derive(Error, Debug)]
pub enum ShimError {
  /// The event could not be encoded as JSON text.
  #[error("Failed to serialize event: {0}")]
  Serialize(#[from] serde_json::Error),

  /// The event body from the runtime is not valid JSON.
  #[error("Failed to decode event: {0}")]
  Decode(#[source] serde_json::Error),

  /// The handler executable could not be started.
  #[error("Failed to spawn {}: {source}", program.display())]
  Spawn {
    program: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Waiting on the child process failed.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// The invocation deadline passed before the child produced any output.
  #[error("Deadline exceeded after {elapsed_ms}ms without output")]
  DeadlineExceeded { elapsed_ms: u64 },
}

impl ShimError {
  /// The `errorType` reported to the runtime API.
  pub fn error_type(&self) -> &'static str {
    match self {
      Self::Serialize(_) => "Shim.Serialize",
      Self::Decode(_) => "Shim.InvalidEvent",
      Self::Spawn { .. } => "Shim.Spawn",
      Self::Io(_) => "Shim.Io",
      Self::DeadlineExceeded { .. } => "Shim.DeadlineExceeded",
    }
  }
}
