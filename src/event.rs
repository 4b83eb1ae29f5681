//! The child's two output streams and its exit, merged into one channel.

use bytes::{Bytes, BytesMut};
use std::process::ExitStatus;
use tokio::{
  io::{AsyncRead, AsyncReadExt},
  process::Child,
  sync::mpsc::Sender,
};

/// Something the child process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
  Stdout(Bytes),
  Stderr(Bytes),
  /// `None` when the child was terminated by a signal.
  Exited(Option<i32>),
}

impl ChildEvent {
  /// The message reported for an output chunk, e.g. `stdout: ok`.
  pub fn message(&self) -> Option<String> {
    match self {
      Self::Stdout(chunk) => Some(format!("stdout: {}", String::from_utf8_lossy(chunk))),
      Self::Stderr(chunk) => Some(format!("stderr: {}", String::from_utf8_lossy(chunk))),
      Self::Exited(_) => None,
    }
  }
}

/// Forward every chunk read from `reader` until EOF, a read error,
/// or the receiver going away.
pub(crate) async fn pump<R>(
  mut reader: R,
  chunk_size: usize,
  tx: Sender<ChildEvent>,
  wrap: fn(Bytes) -> ChildEvent,
) where
  R: AsyncRead + Unpin,
{
  let mut buf = BytesMut::with_capacity(chunk_size);
  loop {
    buf.reserve(chunk_size);
    let mut limited = (&mut reader).take(chunk_size as u64);
    match limited.read_buf(&mut buf).await {
      Ok(0) => break,
      Ok(_) => {
        if tx.send(wrap(buf.split().freeze())).await.is_err() {
          break;
        }
      }
      Err(err) => {
        tracing::warn!("Failed to read from child: {}", err);
        break;
      }
    }
  }
}

/// Wait for the child to exit and forward its exit code.
pub(crate) async fn watch(mut child: Child, tx: Sender<ChildEvent>) -> std::io::Result<ExitStatus> {
  let status = child.wait().await?;
  // the coordinator may already be gone, the status is still returned
  let _ = tx.send(ChildEvent::Exited(status.code())).await;
  Ok(status)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;

  #[test]
  fn output_chunks_are_prefixed_with_their_stream() {
    assert_eq!(
      ChildEvent::Stdout(Bytes::from_static(b"ok")).message().as_deref(),
      Some("stdout: ok")
    );
    assert_eq!(
      ChildEvent::Stderr(Bytes::from_static(b"boom\n")).message().as_deref(),
      Some("stderr: boom\n")
    );
    assert_eq!(ChildEvent::Exited(Some(0)).message(), None);
  }

  #[tokio::test]
  async fn pump_splits_input_into_bounded_chunks() {
    let (tx, mut rx) = mpsc::channel(8);
    pump(&b"abcdefgh"[..], 3, tx, ChildEvent::Stdout).await;

    let mut chunks = Vec::new();
    while let Some(event) = rx.recv().await {
      chunks.push(event);
    }
    assert_eq!(
      chunks,
      vec![
        ChildEvent::Stdout(Bytes::from_static(b"abc")),
        ChildEvent::Stdout(Bytes::from_static(b"def")),
        ChildEvent::Stdout(Bytes::from_static(b"gh")),
      ]
    );
  }

  #[tokio::test]
  async fn pump_stops_when_the_receiver_is_gone() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    pump(&b"ignored"[..], 4, tx, ChildEvent::Stderr).await;
  }
}
