use crate::{ShimError, Signal};
use anyhow::{Context as _, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
  client::conn::http1::{self, SendRequest},
  header::{CONTENT_TYPE, HOST},
  HeaderMap, Method, Request,
};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::{net::TcpStream, time::Instant};

pub const RUNTIME_API_VERSION: &str = "2018-06-01";

pub const REQUEST_ID_HEADER: &str = "lambda-runtime-aws-request-id";
pub const DEADLINE_HEADER: &str = "lambda-runtime-deadline-ms";
pub const FUNCTION_ARN_HEADER: &str = "lambda-runtime-invoked-function-arn";
pub const TRACE_ID_HEADER: &str = "lambda-runtime-trace-id";
pub const ERROR_TYPE_HEADER: &str = "lambda-runtime-function-error-type";

/// One event fetched from `/runtime/invocation/next`.
#[derive(Debug, Clone)]
pub struct Invocation {
  pub request_id: String,
  /// Converted from `Lambda-Runtime-Deadline-Ms`.
  pub deadline: Option<Instant>,
  pub function_arn: Option<String>,
  pub trace_id: Option<String>,
  /// The raw event body.
  pub payload: Bytes,
}

impl Invocation {
  pub fn from_parts(headers: &HeaderMap, payload: Bytes) -> Result<Self> {
    let header = |name: &str| {
      headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    };

    let request_id = header(REQUEST_ID_HEADER).context("Missing request id header")?;
    let deadline = header(DEADLINE_HEADER)
      .map(|ms| {
        ms.parse::<u64>()
          .with_context(|| format!("Invalid deadline header: {ms:?}"))
      })
      .transpose()?
      .map(deadline_from_epoch_ms);

    Ok(Self {
      request_id,
      deadline,
      function_arn: header(FUNCTION_ARN_HEADER),
      trace_id: header(TRACE_ID_HEADER),
      payload,
    })
  }

  /// Decode the event. An empty body is treated as `null`.
  pub fn event(&self) -> Result<Value, ShimError> {
    if self.payload.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&self.payload).map_err(ShimError::Decode)
  }
}

/// The body of an `/error` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
  pub error_message: String,
  pub error_type: String,
}

impl ErrorReport {
  pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
    Self {
      error_message: error_message.into(),
      error_type: error_type.into(),
    }
  }
}

impl From<&ShimError> for ErrorReport {
  fn from(err: &ShimError) -> Self {
    Self::new(err.error_type(), err.to_string())
  }
}

impl From<&anyhow::Error> for ErrorReport {
  fn from(err: &anyhow::Error) -> Self {
    Self::new("Runtime.InitError", format!("{err:#}"))
  }
}

/// A single HTTP/1.1 connection to the runtime API.
pub struct LambdaRuntimeApiClient {
  sender: SendRequest<Full<Bytes>>,
  address: String,
}

impl LambdaRuntimeApiClient {
  /// Create a new client and connect to the runtime API at `AWS_LAMBDA_RUNTIME_API`.
  pub async fn start() -> Result<Self> {
    let address =
      std::env::var("AWS_LAMBDA_RUNTIME_API").context("Missing AWS_LAMBDA_RUNTIME_API env var")?;
    Self::connect(address).await
  }

  /// Connect to the runtime API at `address`, e.g. `127.0.0.1:9001`.
  pub async fn connect(address: impl Into<String>) -> Result<Self> {
    let address = address.into();
    let stream = TcpStream::connect(address.as_str())
      .await
      .with_context(|| format!("Failed to connect to runtime API at {address}"))?;
    let io = TokioIo::new(stream);
    let (sender, conn) = http1::handshake(io)
      .await
      .context("Failed to handshake with runtime API")?;

    // Spawn a task to poll the connection, driving the HTTP state
    tokio::task::spawn(async move {
      if let Err(err) = conn.await {
        tracing::error!("Connection failed: {:?}", err);
      }
    });

    Ok(Self { sender, address })
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  /// Block until the next event is available.
  pub async fn next_invocation(&mut self) -> Result<Invocation> {
    let req = self.request(Method::GET, "runtime/invocation/next", Bytes::new())?;
    let (headers, body) = self.send(req).await?;
    Invocation::from_parts(&headers, body)
  }

  /// Complete an invocation with `message`, encoded as a JSON string.
  pub async fn respond(&mut self, request_id: &str, message: &str) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    let req = self.request(
      Method::POST,
      &format!("runtime/invocation/{request_id}/response"),
      body.into(),
    )?;
    self.send(req).await?;
    Ok(())
  }

  /// Fail an invocation.
  pub async fn report_error(&mut self, request_id: &str, report: &ErrorReport) -> Result<()> {
    let req = self.error_request(&format!("runtime/invocation/{request_id}/error"), report)?;
    self.send(req).await?;
    Ok(())
  }

  /// Report a failure to initialize before any invocation was fetched.
  pub async fn report_init_error(&mut self, report: &ErrorReport) -> Result<()> {
    let req = self.error_request("runtime/init/error", report)?;
    self.send(req).await?;
    Ok(())
  }

  /// Relay a signal from the handler.
  pub async fn signal(&mut self, request_id: &str, signal: &Signal) -> Result<()> {
    match signal {
      Signal::Succeed(message) => self.respond(request_id, message).await,
      Signal::Fail(message) => {
        self
          .report_error(request_id, &ErrorReport::new("Shim.HandlerFailed", message.as_str()))
          .await
      }
    }
  }

  fn request(&self, method: Method, path: &str, body: Bytes) -> Result<Request<Full<Bytes>>> {
    Ok(
      Request::builder()
        .method(method)
        .uri(format!("/{RUNTIME_API_VERSION}/{path}"))
        .header(HOST, &self.address)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body))?,
    )
  }

  fn error_request(&self, path: &str, report: &ErrorReport) -> Result<Request<Full<Bytes>>> {
    let mut req = self.request(Method::POST, path, serde_json::to_vec(report)?.into())?;
    req
      .headers_mut()
      .insert(ERROR_TYPE_HEADER, report.error_type.parse()?);
    Ok(req)
  }

  async fn send(&mut self, req: Request<Full<Bytes>>) -> Result<(HeaderMap, Bytes)> {
    let path = req.uri().path().to_owned();
    self.sender.ready().await?;
    let res = self
      .sender
      .send_request(req)
      .await
      .with_context(|| format!("Request to {path} failed"))?;
    let status = res.status();
    let (parts, body) = res.into_parts();
    let body = body.collect().await?.to_bytes();
    if !status.is_success() {
      anyhow::bail!(
        "Runtime API returned {} for {}: {}",
        status,
        path,
        String::from_utf8_lossy(&body)
      );
    }
    Ok((parts.headers, body))
  }
}

fn deadline_from_epoch_ms(ms: u64) -> Instant {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default();
  Instant::now() + Duration::from_millis(ms).saturating_sub(now)
}
