//! `exec`: run an external program
//!
//! Usage: `exec [--json] [--shell] [--timeout DUR] PROGRAM [ARGS...]`
//!
//! Input items are written to the child's stdin, one per line. Each stdout
//! line becomes one string item, streamed as the child writes it. With
//! `--json` the whole of stdout is parsed instead; a top-level array becomes
//! one item per element. Output that is not valid UTF-8 is decoded lossily.
//!
//! With `--shell` the words after the flags are joined with single spaces and
//! handed to the configured shell (`sh -c` by default). Quotes were already
//! removed when the pipeline was parsed, so `exec --shell grep 'a b' f` runs
//! `grep a b f`. Quote for the inner shell as well (`"'a b'"`) when a word
//! must keep its spaces.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ItemStream, StageContext, StageHandler, StageOutput};
use crate::config::parse_duration;
use crate::{Error, Result};

/// Runs programs as pipeline stages
pub struct ExecHandler {
    /// Shell used by `--shell`
    shell: String,
    /// Applied when the stage has no `--timeout`
    default_timeout: Option<Duration>,
}

impl Default for ExecHandler {
    fn default() -> Self {
        Self::new("sh", None)
    }
}

impl ExecHandler {
    pub fn new(shell: impl Into<String>, default_timeout: Option<Duration>) -> Self {
        Self {
            shell: shell.into(),
            default_timeout,
        }
    }
}

struct ExecArgs {
    json: bool,
    shell: bool,
    timeout: Option<Duration>,
    argv: Vec<String>,
}

fn parse_args(ctx: &StageContext) -> Result<ExecArgs> {
    let mut parsed = ExecArgs {
        json: false,
        shell: false,
        timeout: None,
        argv: Vec::new(),
    };

    let mut args = ctx.args().iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => parsed.json = true,
            "--shell" => parsed.shell = true,
            "--timeout" => {
                let value = args
                    .next()
                    .ok_or_else(|| ctx.error("--timeout needs a duration"))?;
                parsed.timeout = Some(parse_duration(value).map_err(|e| ctx.error(e))?);
            }
            "--" => {
                parsed.argv.extend(args.cloned());
                break;
            }
            flag if flag.starts_with("--") => {
                return Err(ctx.error(format!("unknown flag {}", flag)));
            }
            _ => {
                parsed.argv.push(arg.clone());
                parsed.argv.extend(args.cloned());
                break;
            }
        }
    }

    if parsed.argv.is_empty() {
        return Err(ctx.error("missing program"));
    }
    Ok(parsed)
}

/// Text form of an item as written to a child's stdin
pub fn render_line(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Await `fut`, giving up at `deadline`; `None` means the deadline passed
async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// A spawned child whose stdout is still being read
struct Running {
    child: Child,
    stderr: JoinHandle<String>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    program: String,
}

impl Running {
    /// Wait for exit and turn a failure status into an error
    async fn finish(mut self) -> Result<()> {
        let status = match with_deadline(self.deadline, self.child.wait()).await {
            Some(status) => status?,
            None => return Err(self.timed_out().await),
        };

        let stderr = self.stderr.await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }

        let stderr = stderr.trim();
        Err(Error::HandlerExecution(if stderr.is_empty() {
            format!("exec: {} exited with {}", self.program, status)
        } else {
            format!("exec: {} exited with {}: {}", self.program, status, stderr)
        }))
    }

    async fn timed_out(&mut self) -> Error {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill {}: {}", self.program, e);
        }
        Error::HandlerExecution(format!(
            "exec: {} timed out after {}",
            self.program,
            humantime::format_duration(self.timeout.unwrap_or_default())
        ))
    }
}

/// Read one raw line, without its `\n` or `\r\n`; `None` at end of output
async fn next_line(reader: &mut BufReader<ChildStdout>) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Items for each stdout line, read only as the consumer pulls
fn stream_lines(reader: BufReader<ChildStdout>, running: Running) -> ItemStream {
    stream::unfold(Some((reader, running)), |state| async move {
        let (mut reader, mut running) = state?;
        match with_deadline(running.deadline, next_line(&mut reader)).await {
            Some(Ok(Some(line))) => Some((Ok(Value::String(line)), Some((reader, running)))),
            Some(Ok(None)) => running.finish().await.err().map(|e| (Err(e), None)),
            Some(Err(e)) => Some((Err(read_failed(&running.program, e)), None)),
            None => Some((Err(running.timed_out().await), None)),
        }
    })
    .boxed()
}

fn read_failed(program: &str, e: std::io::Error) -> Error {
    Error::HandlerExecution(format!("exec: failed to read output of {}: {}", program, e))
}

/// Parse the whole of stdout as JSON
fn parse_json_output(program: &str, stdout: &str) -> Result<Vec<Value>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str(stdout) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(value) => Ok(vec![value]),
        Err(e) => Err(Error::HandlerExecution(format!(
            "exec: {} did not print JSON: {}",
            program, e
        ))),
    }
}

#[async_trait]
impl StageHandler for ExecHandler {
    async fn execute(&self, ctx: &StageContext, input: ItemStream) -> Result<StageOutput> {
        let args = parse_args(ctx)?;
        let timeout = args.timeout.or(self.default_timeout);

        let mut command = if args.shell {
            let mut command = Command::new(&self.shell);
            command.arg("-c").arg(args.argv.join(" "));
            command
        } else {
            let mut command = Command::new(&args.argv[0]);
            command.args(&args.argv[1..]);
            command
        };
        let program = if args.shell {
            self.shell.clone()
        } else {
            args.argv[0].clone()
        };

        debug!("Running: {:?}", args.argv);

        let mut child = command
            .stdin(if ctx.has_input {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ctx.error(format!("failed to spawn {}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let mut input = input;
                while let Some(Ok(item)) = input.next().await {
                    let mut line = render_line(&item);
                    line.push('\n');
                    // The child may exit without reading everything
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ctx.error("failed to capture stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ctx.error("failed to capture stderr"))?;
        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut running = Running {
            child,
            stderr,
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            program,
        };

        if !args.json {
            let reader = BufReader::new(stdout);
            return Ok(StageOutput::Items(stream_lines(reader, running)));
        }

        let mut stdout = stdout;
        let mut raw = Vec::new();
        match with_deadline(running.deadline, stdout.read_to_end(&mut raw)).await {
            Some(read) => {
                read.map_err(|e| read_failed(&running.program, e))?;
            }
            None => return Err(running.timed_out().await),
        }
        let out = String::from_utf8_lossy(&raw);
        let program = running.program.clone();
        running.finish().await?;
        Ok(StageOutput::Items(super::item_stream(parse_json_output(
            &program, &out,
        )?)))
    }

    fn usage(&self) -> &str {
        "exec [--json] [--shell] [--timeout DUR] PROGRAM [ARGS...]  run a program, one item per stdout line"
    }
}
