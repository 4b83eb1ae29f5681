use crate::{
  event::{pump, watch},
  ChildEvent, InvocationContext, ShimError, Signal,
};
use anyhow::Context as _;
use serde_json::Value;
use std::{
  ffi::{OsStr, OsString},
  path::{Path, PathBuf},
  process::Stdio,
  time::Duration,
};
use tokio::{
  process::Command,
  sync::mpsc::{self, Receiver},
  time::Instant,
};

/// The handler executable used when nothing else is configured.
pub const DEFAULT_PROGRAM: &str = "./elasticsearch_client";
/// The largest chunk forwarded per read, if not configured.
/// Matches the 64 KiB of a pipe's buffer, so one write usually arrives as one chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// How long output is still collected after the child has exited.
/// Pipes held open by its background processes are abandoned after this.
pub const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// How stderr output is reported to the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrPolicy {
  /// Report stderr chunks as success, like stdout.
  #[default]
  Succeed,
  /// Report stderr chunks as failure.
  Fail,
}

/// Hands each event to an external executable.
/// Use the builder methods or [`Shim::from_env`] to configure it,
/// then call [`Shim::handle`] once per invocation.
#[derive(Debug, Clone)]
pub struct Shim {
  /// See [`Self::program`].
  pub program: PathBuf,
  /// See [`Self::arg`].
  pub args: Vec<OsString>,
  /// See [`Self::current_dir`].
  pub current_dir: Option<PathBuf>,
  /// See [`Self::stderr_policy`].
  pub stderr_policy: StderrPolicy,
  /// See [`Self::chunk_size`].
  pub chunk_size: usize,
}

impl Default for Shim {
  fn default() -> Self {
    Self {
      program: DEFAULT_PROGRAM.into(),
      args: Vec::new(),
      current_dir: None,
      stderr_policy: StderrPolicy::default(),
      chunk_size: DEFAULT_CHUNK_SIZE,
    }
  }
}

/// What happened during one [`Shim::handle`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
  /// The signal delivered to the context, if any output arrived.
  pub delivered: Option<Signal>,
  /// Signals produced by later output chunks.
  /// They are logged but never reach the runtime.
  pub suppressed: Vec<Signal>,
  /// The exit code, if the child exited normally.
  pub exit_code: Option<i32>,
  /// Whether the child was killed at the deadline.
  pub timed_out: bool,
}

impl Report {
  /// Every signal the output produced, delivered or not.
  pub fn signals(&self) -> impl Iterator<Item = &Signal> {
    self.delivered.iter().chain(self.suppressed.iter())
  }
}

impl Shim {
  /// Build the shim from `argv[1..]` and the environment.
  ///
  /// If the current process is started as `bootstrap ./client --flag`,
  /// the handler program is `./client` and `--flag` is passed before the event.
  /// Otherwise the program is read from `AWS_LAMBDA_SHIM_PROGRAM`,
  /// falling back to [`DEFAULT_PROGRAM`].
  pub fn from_env() -> anyhow::Result<Self> {
    Self::from_vars(std::env::args_os().skip(1), |name| std::env::var_os(name))
  }

  /// Like [`Self::from_env`], with the arguments after `argv[0]`
  /// and the variable lookup passed in.
  pub fn from_vars(
    argv: impl IntoIterator<Item = OsString>,
    var: impl Fn(&str) -> Option<OsString>,
  ) -> anyhow::Result<Self> {
    let mut shim = Self::default();

    let mut argv = argv.into_iter();
    if let Some(program) = argv.next() {
      shim.program = program.into();
      shim.args = argv.collect();
    } else if let Some(program) = var("AWS_LAMBDA_SHIM_PROGRAM") {
      shim.program = program.into();
    }

    shim.current_dir = var("LAMBDA_TASK_ROOT").map(PathBuf::from);

    if let Some(value) = var("AWS_LAMBDA_SHIM_STDERR_AS_FAILURE") {
      let value = utf8("AWS_LAMBDA_SHIM_STDERR_AS_FAILURE", &value)?;
      if parse_flag(value)
        .with_context(|| format!("Invalid AWS_LAMBDA_SHIM_STDERR_AS_FAILURE: {value:?}"))?
      {
        shim.stderr_policy = StderrPolicy::Fail;
      }
    }

    if let Some(value) = var("AWS_LAMBDA_SHIM_CHUNK_SIZE") {
      let value = utf8("AWS_LAMBDA_SHIM_CHUNK_SIZE", &value)?;
      let size: usize = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid AWS_LAMBDA_SHIM_CHUNK_SIZE: {value:?}"))?;
      anyhow::ensure!(size > 0, "AWS_LAMBDA_SHIM_CHUNK_SIZE must be positive");
      shim.chunk_size = size;
    }

    Ok(shim)
  }

  /// Set the handler executable.
  /// A relative path with a directory part, like `./client`, is joined onto
  /// [`Self::current_dir`] when that is set. A bare name is looked up in `PATH`.
  pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
    self.program = program.into();
    self
  }

  /// Add a leading argument, passed before the serialized event.
  pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
    self.args.push(arg.into());
    self
  }

  /// Set the working directory of the handler process.
  /// If not set, the handler inherits the current one.
  pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
    self.current_dir = Some(dir.as_ref().to_path_buf());
    self
  }

  /// Set how stderr output is reported. Defaults to [`StderrPolicy::Succeed`].
  pub fn stderr_policy(mut self, policy: StderrPolicy) -> Self {
    self.stderr_policy = policy;
    self
  }

  /// Set the largest chunk forwarded per read. Zero is treated as one.
  pub fn chunk_size(mut self, size: usize) -> Self {
    self.chunk_size = size.max(1);
    self
  }

  /// The path actually executed, see [`Self::program`].
  pub fn resolved_program(&self) -> PathBuf {
    match &self.current_dir {
      Some(dir) if self.program.is_relative() && self.program.components().count() > 1 => {
        dir.join(&self.program)
      }
      _ => self.program.clone(),
    }
  }

  /// Build the handler command for one event.
  pub fn command(&self, payload: &str) -> Command {
    let mut command = Command::new(self.resolved_program());
    command
      .args(&self.args)
      .arg(payload)
      // the event travels in argv; the handler reads EOF on stdin
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(dir) = &self.current_dir {
      command.current_dir(dir);
    }
    command
  }

  /// Run the handler executable for one event.
  ///
  /// The event is passed as JSON text in a single argument.
  /// The first output chunk on either stream signals `context`,
  /// later chunks are recorded in [`Report::suppressed`].
  /// The child is observed until it exits, or killed at `deadline`.
  pub async fn handle(
    &self,
    event: &Value,
    context: InvocationContext,
    deadline: Option<Instant>,
  ) -> Result<Report, ShimError> {
    self.handle_with(event, context, deadline, |_| {}).await
  }

  /// Like [`Self::handle`], with a hook to adjust the command before it is spawned.
  pub async fn handle_with(
    &self,
    event: &Value,
    context: InvocationContext,
    deadline: Option<Instant>,
    configure: impl FnOnce(&mut Command),
  ) -> Result<Report, ShimError> {
    let payload = serde_json::to_string(event)?;
    let mut command = self.command(&payload);
    configure(&mut command);

    let mut child = command.spawn().map_err(|source| ShimError::Spawn {
      program: self.program.clone(),
      source,
    })?;
    tracing::debug!(program = %self.program.display(), pid = ?child.id(), "Spawned handler");

    let (tx, rx) = mpsc::channel(16);
    let mut tasks = Vec::with_capacity(3);
    if let Some(stdout) = child.stdout.take() {
      tasks.push(tokio::spawn(pump(stdout, self.chunk_size, tx.clone(), ChildEvent::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
      tasks.push(tokio::spawn(pump(stderr, self.chunk_size, tx.clone(), ChildEvent::Stderr)));
    }
    let watcher = tokio::spawn(watch(child, tx));

    let started = Instant::now();
    let report = coordinate(rx, context, self.stderr_policy, deadline).await;

    // pumps still running are stuck on pipes inherited by background processes
    for task in tasks {
      task.abort();
    }

    if report.timed_out {
      // dropping the child kills it
      watcher.abort();
      if report.delivered.is_none() {
        return Err(ShimError::DeadlineExceeded {
          elapsed_ms: started.elapsed().as_millis() as u64,
        });
      }
      return Ok(report);
    }

    match watcher.await {
      Ok(result) => {
        result?;
      }
      Err(err) => tracing::error!("Exit watcher failed: {}", err),
    }
    Ok(report)
  }
}

/// Consume child events until every sender is gone, [`EXIT_DRAIN`] has passed
/// since the child exited, or the deadline passes.
/// The first output chunk signals `context`, every later one is suppressed.
pub async fn coordinate(
  mut rx: Receiver<ChildEvent>,
  context: InvocationContext,
  stderr_policy: StderrPolicy,
  deadline: Option<Instant>,
) -> Report {
  let mut report = Report::default();
  let mut context = Some(context);
  let mut drain: Option<Instant> = None;

  loop {
    let wait_until = match (deadline, drain) {
      (Some(deadline), Some(drain)) => Some(deadline.min(drain)),
      (deadline, drain) => deadline.or(drain),
    };
    let event = match wait_until {
      Some(until) => match tokio::time::timeout_at(until, rx.recv()).await {
        Ok(event) => event,
        Err(_) if drain.is_some_and(|drain| drain <= until) => {
          tracing::debug!("Handler exited, abandoning its open pipes");
          break;
        }
        Err(_) => {
          tracing::warn!("Deadline reached, killing handler");
          report.timed_out = true;
          break;
        }
      },
      None => rx.recv().await,
    };
    let Some(event) = event else { break };

    let signal = match &event {
      ChildEvent::Exited(code) => {
        match code {
          Some(code) => tracing::info!("lambda exited with code {}", code),
          None => tracing::info!("lambda exited with code null"),
        }
        report.exit_code = *code;
        drain = Some(Instant::now() + EXIT_DRAIN);
        continue;
      }
      ChildEvent::Stdout(_) => event.message().map(Signal::Succeed),
      ChildEvent::Stderr(_) => event.message().map(|msg| match stderr_policy {
        StderrPolicy::Succeed => Signal::Succeed(msg),
        StderrPolicy::Fail => Signal::Fail(msg),
      }),
    };
    let Some(signal) = signal else { continue };
    tracing::info!("{}", signal.message());

    match context.take() {
      Some(context) => {
        context.signal(signal.clone());
        report.delivered = Some(signal);
      }
      None => {
        tracing::warn!(?signal, "Invocation already signaled, suppressing");
        report.suppressed.push(signal);
      }
    }
  }

  if report.delivered.is_none() && !report.timed_out {
    tracing::warn!("Handler produced no output, the invocation is left unsignaled");
  }
  report
}

fn utf8<'a>(name: &str, value: &'a OsStr) -> anyhow::Result<&'a str> {
  value
    .to_str()
    .with_context(|| format!("{name} is not valid UTF-8"))
}

fn parse_flag(value: &str) -> anyhow::Result<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "" | "0" | "false" | "no" | "off" => Ok(false),
    other => anyhow::bail!("Invalid boolean flag: {other:?}"),
  }
}
