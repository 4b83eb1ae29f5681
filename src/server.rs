//! A local stand-in for the lambda runtime API.
//!
//! [`RuntimeApiEmulator`] serves the same endpoints the real runtime does,
//! hands out events queued with [`RuntimeApiEmulator::invoke`] and records
//! whatever the runtime posts back as [`Outcome`]s.
//! Use it to run the shim outside lambda.

use crate::client::{
  DEADLINE_HEADER, ERROR_TYPE_HEADER, REQUEST_ID_HEADER, RUNTIME_API_VERSION, TRACE_ID_HEADER,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
  body::Incoming, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::{
  convert::Infallible,
  net::SocketAddr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
  net::TcpListener,
  sync::{mpsc, Mutex},
  task::JoinHandle,
};

/// What the runtime reported for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// `POST /runtime/invocation/{id}/response`
  Response { request_id: String, body: Value },
  /// `POST /runtime/invocation/{id}/error`
  Error {
    request_id: String,
    error_type: Option<String>,
    body: Value,
  },
  /// `POST /runtime/init/error`
  InitError { error_type: Option<String>, body: Value },
}

struct PendingInvocation {
  request_id: String,
  deadline_ms: Option<u64>,
  trace_id: Option<String>,
  event: Value,
}

struct State {
  pending: Mutex<mpsc::UnboundedReceiver<PendingInvocation>>,
  outcomes: mpsc::UnboundedSender<Outcome>,
}

pub struct RuntimeApiEmulator {
  addr: SocketAddr,
  next_id: AtomicU64,
  pending: mpsc::UnboundedSender<PendingInvocation>,
  outcomes: mpsc::UnboundedReceiver<Outcome>,
  task: JoinHandle<()>,
}

impl RuntimeApiEmulator {
  /// Bind to a free local port and start serving.
  pub async fn start() -> std::io::Result<Self> {
    Self::bind(0).await
  }

  pub async fn bind(port: u16) -> std::io::Result<Self> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    let addr = listener.local_addr()?;

    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let state = Arc::new(State {
      pending: Mutex::new(pending_rx),
      outcomes: outcome_tx,
    });

    let task = tokio::spawn(async move {
      loop {
        let stream = match listener.accept().await {
          Ok((stream, _)) => stream,
          Err(err) => {
            tracing::error!("Failed to accept connection: {:?}", err);
            continue;
          }
        };
        let state = state.clone();
        tokio::spawn(async move {
          let io = TokioIo::new(stream);
          if let Err(err) = http1::Builder::new()
            .serve_connection(io, service_fn(move |req| route(state.clone(), req)))
            .await
          {
            tracing::error!("Error serving connection: {:?}", err);
          }
        });
      }
    });

    Ok(Self {
      addr,
      next_id: AtomicU64::new(1),
      pending: pending_tx,
      outcomes: outcome_rx,
      task,
    })
  }

  /// The `host:port` to put in `AWS_LAMBDA_RUNTIME_API`.
  pub fn address(&self) -> String {
    self.addr.to_string()
  }

  /// Queue an event and return its request id.
  pub fn invoke(&self, event: Value) -> String {
    self.enqueue(event, None, None)
  }

  /// Queue an event that must complete within `timeout`.
  pub fn invoke_with_timeout(&self, event: Value, timeout: Duration) -> String {
    let now = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default();
    let deadline_ms = (now + timeout).as_millis() as u64;
    self.enqueue(event, Some(deadline_ms), None)
  }

  /// Queue an event carrying an X-Ray trace id.
  pub fn invoke_traced(&self, event: Value, trace_id: impl Into<String>) -> String {
    self.enqueue(event, None, Some(trace_id.into()))
  }

  fn enqueue(&self, event: Value, deadline_ms: Option<u64>, trace_id: Option<String>) -> String {
    let request_id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
    // the receiver lives as long as the server task
    let _ = self.pending.send(PendingInvocation {
      request_id: request_id.clone(),
      deadline_ms,
      trace_id,
      event,
    });
    request_id
  }

  /// Wait for the next thing the runtime reports.
  pub async fn next_outcome(&mut self) -> Option<Outcome> {
    self.outcomes.recv().await
  }
}

impl Drop for RuntimeApiEmulator {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn route(state: Arc<State>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
  let method = req.method().clone();
  let path = req
    .uri()
    .path()
    .strip_prefix(&format!("/{RUNTIME_API_VERSION}/"))
    .map(str::to_owned);
  let error_type = req
    .headers()
    .get(ERROR_TYPE_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(str::to_owned);

  let body = match req.into_body().collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(err) => return Ok(status(StatusCode::BAD_REQUEST, &err.to_string())),
  };
  let body: Value = if body.is_empty() {
    Value::Null
  } else {
    match serde_json::from_slice(&body) {
      Ok(value) => value,
      Err(err) => return Ok(status(StatusCode::BAD_REQUEST, &err.to_string())),
    }
  };

  let Some(path) = path else {
    return Ok(status(StatusCode::NOT_FOUND, "Unknown API version"));
  };
  let segments: Vec<&str> = path.split('/').collect();

  let outcome = match (method, segments.as_slice()) {
    (Method::GET, ["runtime", "invocation", "next"]) => return Ok(next(&state).await),
    (Method::POST, ["runtime", "invocation", id, "response"]) => Outcome::Response {
      request_id: (*id).to_owned(),
      body,
    },
    (Method::POST, ["runtime", "invocation", id, "error"]) => Outcome::Error {
      request_id: (*id).to_owned(),
      error_type,
      body,
    },
    (Method::POST, ["runtime", "init", "error"]) => Outcome::InitError { error_type, body },
    _ => return Ok(status(StatusCode::NOT_FOUND, "Unknown endpoint")),
  };

  tracing::debug!(?outcome, "Runtime reported");
  let _ = state.outcomes.send(outcome);
  Ok(status(StatusCode::ACCEPTED, "OK"))
}

async fn next(state: &State) -> Response<Full<Bytes>> {
  let Some(invocation) = state.pending.lock().await.recv().await else {
    return status(StatusCode::GONE, "Emulator is shutting down");
  };

  let mut res = Response::builder()
    .status(StatusCode::OK)
    .header(REQUEST_ID_HEADER, &invocation.request_id);
  if let Some(deadline_ms) = invocation.deadline_ms {
    res = res.header(DEADLINE_HEADER, deadline_ms.to_string());
  }
  if let Some(trace_id) = &invocation.trace_id {
    res = res.header(TRACE_ID_HEADER, trace_id);
  }

  let body = serde_json::to_vec(&invocation.event).unwrap_or_default();
  res
    .body(Full::new(body.into()))
    .unwrap_or_else(|err| status(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))
}

fn status(code: StatusCode, message: &str) -> Response<Full<Bytes>> {
  let mut res = Response::new(Full::new(Bytes::copy_from_slice(message.as_bytes())));
  *res.status_mut() = code;
  res
}
