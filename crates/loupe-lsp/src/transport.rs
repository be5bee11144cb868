use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result as AnyResult, anyhow};
use loupe_core::{Error, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

pub type NotificationHandler = Box<dyn Fn(Value) + Send + Sync>;

/// Responder for server-to-client *requests*. Returning a value sends it
/// back under the request id; servers deadlock when these go unanswered,
/// so the transport falls back to `null` for unhandled methods.
pub type ServerRequestPolicy = Arc<dyn Fn(&str, Option<&Value>) -> Value + Send + Sync>;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub request_timeout: Duration,
}

#[derive(Default)]
struct PendingTable {
    next_id: i64,
    slots: HashMap<i64, oneshot::Sender<Value>>,
}

type HandlerMap = Arc<std::sync::Mutex<HashMap<String, NotificationHandler>>>;

/// Line-framed JSON-RPC 2.0 over a child process's stdio: one writer
/// mutex, one reader task, completions routed back by id. Exactly-once
/// delivery per id; a timed-out id stays consumed and its eventual
/// response is dropped.
pub struct Transport {
    writer: Arc<Mutex<BoxWriter>>,
    pending: Arc<Mutex<PendingTable>>,
    closed: Arc<AtomicBool>,
    handlers: HandlerMap,
    child: Mutex<Option<Child>>,
    default_timeout: Duration,
}

impl Transport {
    /// Spawn `command` and frame its stdio.
    pub async fn spawn(options: TransportOptions, policy: ServerRequestPolicy) -> Result<Self> {
        let mut command = Command::new(&options.command);
        command
            .args(&options.args)
            .current_dir(&options.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn language server: {}", options.command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture language server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture language server stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }

        let transport = Self::attach(stdout, stdin, options.request_timeout, policy);
        *transport.child.lock().await = Some(child);
        Ok(transport)
    }

    /// Frame an arbitrary reader/writer pair. Used by tests (via
    /// `tokio::io::duplex`) and by non-stdio transports.
    pub fn attach(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        request_timeout: Duration,
        policy: ServerRequestPolicy,
    ) -> Self {
        let writer: Arc<Mutex<BoxWriter>> = Arc::new(Mutex::new(Box::new(writer)));
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let handlers: HandlerMap = Arc::new(std::sync::Mutex::new(HashMap::new()));

        spawn_reader(
            Box::new(reader) as BoxReader,
            writer.clone(),
            pending.clone(),
            closed.clone(),
            handlers.clone(),
            policy,
        );

        Self {
            writer,
            pending,
            closed,
            handlers,
            child: Mutex::new(None),
            default_timeout: request_timeout,
        }
    }

    /// Register a handler for server-initiated notifications. Handlers run
    /// on the reader task and must not block it; hand long work off.
    /// Register before triggering server activity to avoid missing early
    /// notifications.
    pub fn on_notification(&self, method: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        if let Ok(mut map) = self.handlers.lock() {
            map.insert(method.to_string(), Box::new(handler));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let (id, rx) = {
            let mut table = self.pending.lock().await;
            let id = table.next_id;
            table.next_id += 1;
            let (tx, rx) = oneshot::channel();
            table.slots.insert(id, tx);
            (id, rx)
        };

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_frame(&frame).await {
            self.forget(id).await;
            return Err(err);
        }

        let message = match timeout(wait, rx).await {
            Err(_elapsed) => {
                // Cancel only the local wait; the id stays consumed and the
                // reader drops whatever arrives for it later.
                self.forget(id).await;
                return Err(Error::Timeout {
                    method: method.to_string(),
                });
            }
            Ok(Err(_recv)) => return Err(Error::TransportClosed),
            Ok(Ok(message)) => message,
        };

        if let Some(error) = message.get("error") {
            let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(-32603);
            let text = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(Error::Lsp {
                code,
                message: text,
            });
        }

        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_frame(&frame).await
    }

    /// Terminate the child process (if any) and close the transport.
    pub async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        let mut table = self.pending.lock().await;
        table.slots.clear();
    }

    async fn write_frame(&self, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value).context("failed to serialize frame")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!("transport write failed: {err}");
            self.closed.store(true, Ordering::SeqCst);
            return Err(Error::TransportClosed);
        }
        Ok(())
    }

    async fn forget(&self, id: i64) {
        let mut table = self.pending.lock().await;
        table.slots.remove(&id);
    }
}

fn spawn_reader(
    reader: BoxReader,
    writer: Arc<Mutex<BoxWriter>>,
    pending: Arc<Mutex<PendingTable>>,
    closed: Arc<AtomicBool>,
    handlers: HandlerMap,
    policy: ServerRequestPolicy,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(message)) => {
                    dispatch_message(message, &writer, &pending, &handlers, &policy).await;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read language server frame: {err:#}");
                    break;
                }
            }
        }

        // Stream is gone: fail everything in flight and everything after.
        closed.store(true, Ordering::SeqCst);
        let mut table = pending.lock().await;
        if !table.slots.is_empty() {
            debug!(
                "transport closed with {} outstanding request(s)",
                table.slots.len()
            );
        }
        table.slots.clear();
    });
}

async fn dispatch_message(
    message: Value,
    writer: &Arc<Mutex<BoxWriter>>,
    pending: &Arc<Mutex<PendingTable>>,
    handlers: &HandlerMap,
    policy: &ServerRequestPolicy,
) {
    if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
        if let Some(id) = message.get("id").cloned() {
            // Server-to-client request.
            let result = policy(method, message.get("params"));
            let response = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            });
            if let Err(err) = write_frame_to(writer, &response).await {
                warn!("failed to answer server request {method}: {err:#}");
            }
            return;
        }

        // Notification.
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let handled = {
            let map = match handlers.lock() {
                Ok(map) => map,
                Err(_) => return,
            };
            if let Some(handler) = map.get(method) {
                handler(params);
                true
            } else {
                false
            }
        };
        if !handled {
            debug!("unhandled server notification: {method}");
        }
        return;
    }

    let id = match message.get("id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    let Some(id) = id else {
        debug!("dropping frame without method or id");
        return;
    };

    let slot = {
        let mut table = pending.lock().await;
        table.slots.remove(&id)
    };
    match slot {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => debug!("dropping response for unknown or abandoned id {id}"),
    }
}

pub(crate) async fn write_frame_to(
    writer: &Arc<Mutex<BoxWriter>>,
    value: &Value,
) -> AnyResult<()> {
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, value).await
}

/// Write one framed message to any writer. Useful for implementing fake
/// or proxy servers on top of the same wire format.
pub async fn write_frame<W>(writer: &mut W, value: &Value) -> AnyResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message; `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut BufReader<R>) -> AnyResult<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let Some(len) = content_length else {
        return Err(anyhow!("missing Content-Length header"));
    };

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let value: Value = serde_json::from_slice(&buf)?;
    Ok(Some(value))
}

fn spawn_stderr_logger(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => debug!(target: "ls.stderr", "{}", line.trim_end()),
                Err(_) => break,
            }
        }
    });
}

/// Responder used for every language server loupe drives. Returning
/// `null` for unknown methods keeps servers from deadlocking on an
/// unanswered request.
pub fn default_server_request_policy(root_uri: String) -> ServerRequestPolicy {
    Arc::new(move |method, params| match method {
        // Servers pull settings through workspace/configuration; nulls
        // mean "use your defaults".
        "workspace/configuration" => {
            let count = params
                .and_then(|p| p.get("items"))
                .and_then(|v| v.as_array())
                .map(|items| items.len())
                .unwrap_or(0);
            Value::Array(vec![Value::Null; count])
        }
        "workspace/workspaceFolders" => json!([{
            "uri": root_uri,
            "name": "workspace"
        }]),
        "workspace/applyEdit" => json!({
            "applied": false,
            "failureReason": "loupe does not apply server-initiated workspace edits",
        }),
        "client/registerCapability" | "client/unregisterCapability" => Value::Null,
        "window/workDoneProgress/create" => Value::Null,
        "window/showMessageRequest" => Value::Null,
        other => {
            debug!("unhandled server request: {other}");
            Value::Null
        }
    })
}
