//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::TransportKind;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    cancellation, reply_to_server_request, EventSink, PendingRequests, Transport,
    TransportEvent, TransportOptions,
};
use crate::error::TransportError;
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Number of stderr lines retained per server.
pub const STDERR_TAIL_LINES: usize = 64;

/// How long to wait for an exit status once stdout has closed.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);

/// Standard I/O transport for MCP servers.
///
/// This transport spawns a child process and communicates via stdin/stdout
/// using newline-delimited JSON messages. A background task reads stdout and
/// routes each frame: responses to their waiting request, notifications to the
/// event queue, and server requests back to the server with a reply. Lines
/// that are not JSON-RPC (servers that log to stdout) are skipped.
pub struct StdioTransport {
    shared: Arc<Shared>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

struct Shared {
    server: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingRequests,
    connected: AtomicBool,
    /// Set once the process has gone away on its own.
    exit_status: parking_lot::Mutex<Option<Option<i32>>>,
    stderr_tail: parking_lot::Mutex<VecDeque<String>>,
    events: EventSink,
}

impl StdioTransport {
    /// Spawn `command` and start reading its output.
    ///
    /// Environment values are handed to the child as-is and never logged.
    pub async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        debug!(
            server = %server,
            command = command,
            args = ?args,
            "Spawning MCP server process"
        );

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdout"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stderr"))
        })?;

        debug!(server = %server, pid = ?child.id(), "MCP server process spawned");

        let (sink, events) = EventSink::channel(server, options.event_buffer);
        let shared = Arc::new(Shared {
            server: server.to_string(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            pending: PendingRequests::new(options.max_pending),
            connected: AtomicBool::new(true),
            exit_status: parking_lot::Mutex::new(None),
            stderr_tail: parking_lot::Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            events: sink,
        });

        let reader = tokio::spawn(read_stdout(Arc::clone(&shared), stdout));
        let stderr = tokio::spawn(read_stderr(Arc::clone(&shared), stderr));

        Ok(Self {
            shared,
            events: parking_lot::Mutex::new(Some(events)),
            reader,
            stderr,
        })
    }

    /// The most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.shared.stderr_tail.lock().iter().cloned().collect()
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> TransportError {
        match *self.exit_status.lock() {
            Some(status) => TransportError::PeerExited { status },
            None => TransportError::NotConnected,
        }
    }

    async fn write_frame<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let mut frame = serde_json::to_string(message)?;
        frame.push('\n');

        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(self.closed_error());
        };
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(TransportError::WriteError)?;
        stdin.flush().await.map_err(TransportError::WriteError)?;
        Ok(())
    }

    async fn dispatch(&self, line: &str) {
        if line.is_empty() {
            return;
        }

        match IncomingMessage::parse(line) {
            Ok(IncomingMessage::Response(response)) => {
                let id = response.id.clone();
                if !self.pending.complete(response) {
                    debug!(server = %self.server, id = %id, "Discarding response with no waiting request");
                }
            }
            Ok(IncomingMessage::Notification(notification)) => {
                self.events.notification(notification);
            }
            Ok(IncomingMessage::Request(request)) => {
                debug!(server = %self.server, method = %request.method, "Answering server request");
                let reply = reply_to_server_request(&request);
                if let Err(e) = self.write_frame(&reply).await {
                    warn!(server = %self.server, error = %e, "Failed to answer server request");
                }
            }
            Err(reason) => {
                debug!(server = %self.server, reason = %reason, "Ignoring non-JSON-RPC output on stdout");
            }
        }
    }

    /// Stdout is gone. If we did not close it ourselves, the peer exited.
    async fn on_reader_exit(&self, read_error: Option<std::io::Error>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            self.pending.fail_all(|| TransportError::ConnectionClosed);
            return;
        }

        let status = {
            let mut child = self.child.lock().await;
            match tokio::time::timeout(EXIT_STATUS_WAIT, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => None,
            }
        };
        *self.exit_status.lock() = Some(status);
        self.stdin.lock().await.take();

        match read_error {
            Some(e) => warn!(server = %self.server, error = %e, "Failed reading from MCP server"),
            None => warn!(server = %self.server, status = ?status, "MCP server exited"),
        }

        self.pending
            .fail_all(|| TransportError::PeerExited { status });
        self.events
            .closed(TransportError::PeerExited { status }.to_string())
            .await;
    }

    /// SIGTERM, then kill after two seconds.
    async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if !matches!(child.try_wait(), Ok(None)) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            debug!(server = %self.server, pid = pid, "Sending SIGTERM to MCP server");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            tokio::select! {
                _ = child.wait() => {
                    debug!(server = %self.server, "MCP server exited gracefully");
                }
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    warn!(server = %self.server, "MCP server did not exit gracefully, killing");
                    let _ = child.kill().await;
                }
            }
            return;
        }

        let _ = child.kill().await;
    }
}

async fn read_stdout(shared: Arc<Shared>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    let read_error = loop {
        match lines.next_line().await {
            Ok(Some(line)) => shared.dispatch(line.trim()).await,
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };
    shared.on_reader_exit(read_error).await;
}

async fn read_stderr(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %shared.server, "stderr: {}", line);
        let mut tail = shared.stderr_tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        request: JsonRpcRequest<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse<Value>, TransportError> {
        let shared = &self.shared;
        if !shared.is_connected() {
            return Err(shared.closed_error());
        }

        let id = request.id.clone();
        let slot = shared.pending.register(id.clone())?;

        let written = match tokio::time::timeout(timeout, shared.write_frame(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        if let Err(e) = written {
            return Err(if shared.is_connected() {
                e
            } else {
                shared.closed_error()
            });
        }

        debug!(server = %shared.server, method = %request.method, id = %id, "Sent request");

        match slot.wait(timeout).await {
            Err(TransportError::Timeout(after)) => {
                debug!(server = %shared.server, id = %id, "Request timed out, notifying server");
                if let Err(e) = shared.write_frame(&cancellation(&request, after)).await {
                    debug!(server = %shared.server, error = %e, "Failed to send cancellation");
                }
                Err(TransportError::Timeout(after))
            }
            other => other,
        }
    }

    async fn notify(
        &self,
        notification: JsonRpcNotification<Value>,
    ) -> Result<(), TransportError> {
        if !self.shared.is_connected() {
            return Err(self.shared.closed_error());
        }
        self.shared.write_frame(&notification).await
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) {
        let shared = &self.shared;
        if shared.connected.swap(false, Ordering::SeqCst) {
            debug!(server = %shared.server, "Closing MCP server transport");
        }

        // EOF on stdin is the polite shutdown request.
        shared.stdin.lock().await.take();
        shared.terminate().await;
        shared.pending.fail_all(|| TransportError::ConnectionClosed);
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop(true) reaps the child once the tasks release it.
        self.reader.abort();
        self.stderr.abort();
    }
}
