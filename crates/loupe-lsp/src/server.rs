use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::Context;
use loupe_core::cache::{CacheKey, SymbolCache};
use loupe_core::hashing::sha256_hex;
use loupe_core::lang::Language;
use loupe_core::symbols::{Location, Position, SymbolTree};
use loupe_core::{Error, Result};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::convert::{
    WorkspaceEdit, normalize_workspace_edit, parse_locations, path_to_uri,
    symbol_tree_from_response,
};
use crate::transport::{Transport, TransportOptions, default_server_request_policy};

/// Lifecycle of one language-server instance. Everything but `start` is
/// rejected outside `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

const STATE_UNSTARTED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_STOPPING: u8 = 3;
const STATE_STOPPED: u8 = 4;
const STATE_FAILED: u8 = 5;

impl ServerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_STARTING => ServerState::Starting,
            STATE_READY => ServerState::Ready,
            STATE_STOPPING => ServerState::Stopping,
            STATE_STOPPED => ServerState::Stopped,
            STATE_FAILED => ServerState::Failed,
            _ => ServerState::Unstarted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LanguageServerOptions {
    /// Stable identifier used in cache keys and logs, e.g. `rust-analyzer`.
    pub ls_id: String,
    pub language: Language,
    pub command: String,
    pub args: Vec<String>,
    pub workspace_root: PathBuf,
    pub initialize_timeout: Duration,
    pub request_timeout: Duration,
    pub initialize_options: Option<Value>,
}

#[derive(Debug, Clone)]
struct FileEntry {
    /// Strictly monotonic; didOpen is version 1 and every didChange bumps
    /// it by one.
    version: i32,
    content_hash: String,
}

/// Symbol tree for a file together with the content hash it was computed
/// from.
#[derive(Debug, Clone)]
pub struct FileSymbols {
    pub tree: SymbolTree,
    pub content_hash: String,
}

/// Wraps one running language-server subprocess: initialize handshake,
/// open-file bookkeeping, cache-backed symbol queries and rename.
pub struct LanguageServer {
    transport: Transport,
    state: AtomicU8,
    open_files: Mutex<HashMap<PathBuf, FileEntry>>,
    capabilities: Value,
    cache: Arc<SymbolCache>,
    ls_id: String,
    language: Language,
    /// Latest published diagnostics per uri, refreshed by the server's
    /// push notifications.
    diagnostics: Arc<std::sync::Mutex<HashMap<String, Vec<Value>>>>,
}

impl std::fmt::Debug for LanguageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageServer")
            .field("ls_id", &self.ls_id)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl LanguageServer {
    /// Spawn the subprocess and run the LSP handshake.
    pub async fn start(options: LanguageServerOptions, cache: Arc<SymbolCache>) -> Result<Self> {
        let root_uri = url::Url::from_directory_path(&options.workspace_root)
            .map_err(|_| {
                Error::StartupFailed(format!(
                    "cannot build rootUri for {:?}",
                    options.workspace_root
                ))
            })?
            .to_string();

        let transport = Transport::spawn(
            TransportOptions {
                command: options.command.clone(),
                args: options.args.clone(),
                cwd: options.workspace_root.clone(),
                request_timeout: options.request_timeout,
            },
            default_server_request_policy(root_uri.clone()),
        )
        .await
        .map_err(|err| Error::StartupFailed(format!("{err:#}")))?;

        Self::handshake(transport, root_uri, options, cache).await
    }

    /// Run the handshake over an already established transport. Lets tests
    /// and non-stdio deployments supply their own wiring.
    pub async fn attach(
        transport: Transport,
        options: LanguageServerOptions,
        cache: Arc<SymbolCache>,
    ) -> Result<Self> {
        let root_uri = url::Url::from_directory_path(&options.workspace_root)
            .map_err(|_| {
                Error::StartupFailed(format!(
                    "cannot build rootUri for {:?}",
                    options.workspace_root
                ))
            })?
            .to_string();
        Self::handshake(transport, root_uri, options, cache).await
    }

    async fn handshake(
        transport: Transport,
        root_uri: String,
        options: LanguageServerOptions,
        cache: Arc<SymbolCache>,
    ) -> Result<Self> {
        transport.on_notification("window/logMessage", |params| {
            let text = params
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            debug!(target: "ls.log", "{text}");
        });
        transport.on_notification("$/progress", |params| {
            debug!(target: "ls.progress", "{params}");
        });
        let diagnostics: Arc<std::sync::Mutex<HashMap<String, Vec<Value>>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        {
            let diagnostics = diagnostics.clone();
            transport.on_notification("textDocument/publishDiagnostics", move |params| {
                let Some(uri) = params.get("uri").and_then(|u| u.as_str()) else {
                    return;
                };
                let items = params
                    .get("diagnostics")
                    .and_then(|d| d.as_array())
                    .cloned()
                    .unwrap_or_default();
                debug!(target: "ls.diagnostics", "{uri}: {} diagnostic(s)", items.len());
                if let Ok(mut buf) = diagnostics.lock() {
                    buf.insert(uri.to_string(), items);
                }
            });
        }

        let mut params = json!({
            "processId": null,
            "rootUri": root_uri,
            "capabilities": {
                "workspace": {
                    "workspaceFolders": true,
                    "configuration": true,
                    "workspaceEdit": { "documentChanges": true }
                },
                "textDocument": {
                    "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                    "rename": { "prepareSupport": true }
                },
                "window": { "workDoneProgress": true }
            },
            "workspaceFolders": [
                { "uri": root_uri, "name": "workspace" }
            ]
        });
        if let Some(init) = options.initialize_options.as_ref()
            && let Some(obj) = params.as_object_mut()
        {
            obj.insert("initializationOptions".to_string(), init.clone());
        }

        let state = AtomicU8::new(STATE_STARTING);
        let init_result = match transport
            .call_with_timeout("initialize", params, options.initialize_timeout)
            .await
        {
            Ok(value) => value,
            Err(err) => {
                transport.kill().await;
                return Err(Error::StartupFailed(format!("initialize failed: {err}")));
            }
        };
        let capabilities = init_result
            .get("capabilities")
            .cloned()
            .unwrap_or(Value::Null);

        if let Err(err) = transport.notify("initialized", json!({})).await {
            transport.kill().await;
            return Err(Error::StartupFailed(format!("initialized failed: {err}")));
        }

        state.store(STATE_READY, Ordering::SeqCst);
        debug!("language server ready: {}", options.ls_id);

        Ok(Self {
            transport,
            state,
            open_files: Mutex::new(HashMap::new()),
            capabilities,
            cache,
            ls_id: options.ls_id,
            language: options.language,
            diagnostics,
        })
    }

    /// Last diagnostics the server pushed for a file, if any.
    pub fn cached_diagnostics(&self, path: &Path) -> Result<Vec<Value>> {
        let uri = path_to_uri(path)?;
        let buf = self
            .diagnostics
            .lock()
            .map_err(|_| Error::ServerDown("diagnostics buffer poisoned".to_string()))?;
        Ok(buf.get(&uri).cloned().unwrap_or_default())
    }

    pub fn ls_id(&self) -> &str {
        &self.ls_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Symbol tree for the file at its current on-disk content, resolved
    /// through the cache when the hash matches a prior index.
    pub async fn document_symbols(&self, path: &Path) -> Result<FileSymbols> {
        let (abs, hash) = self.ensure_open(path).await?;

        let key = CacheKey {
            file_path: abs.clone(),
            content_hash: hash.clone(),
            ls_id: self.ls_id.clone(),
        };
        if let Some(tree) = self.cache.get(&key).await {
            debug!("symbol cache hit for {abs:?}");
            return Ok(FileSymbols {
                tree,
                content_hash: hash,
            });
        }

        let uri = path_to_uri(&abs)?;
        let value = self
            .request("textDocument/documentSymbol", json!({
                "textDocument": { "uri": uri }
            }))
            .await?;
        let tree = symbol_tree_from_response(value)?;

        if let Err(err) = self.cache.put(&key, &tree).await {
            warn!("symbol cache write failed for {abs:?}: {err}");
        }
        Ok(FileSymbols {
            tree,
            content_hash: hash,
        })
    }

    pub async fn references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Result<Vec<Location>> {
        let (abs, _) = self.ensure_open(path).await?;
        let uri = path_to_uri(&abs)?;
        let value = self
            .request("textDocument/references", json!({
                "textDocument": { "uri": uri },
                "position": position,
                "context": { "includeDeclaration": include_declaration }
            }))
            .await?;
        parse_locations(value)
    }

    pub async fn definition(&self, path: &Path, position: Position) -> Result<Vec<Location>> {
        let (abs, _) = self.ensure_open(path).await?;
        let uri = path_to_uri(&abs)?;
        let value = self
            .request("textDocument/definition", json!({
                "textDocument": { "uri": uri },
                "position": position
            }))
            .await?;
        parse_locations(value)
    }

    pub async fn hover(&self, path: &Path, position: Position) -> Result<Value> {
        let (abs, _) = self.ensure_open(path).await?;
        let uri = path_to_uri(&abs)?;
        self.request("textDocument/hover", json!({
            "textDocument": { "uri": uri },
            "position": position
        }))
        .await
    }

    /// Ask the server for a rename WorkspaceEdit. The edit is *not*
    /// applied here; the edit engine owns application.
    pub async fn rename(
        &self,
        path: &Path,
        position: Position,
        new_name: &str,
    ) -> Result<WorkspaceEdit> {
        let rename_capability = self.capabilities.get("renameProvider");
        let supported = match rename_capability {
            Some(Value::Bool(b)) => *b,
            Some(Value::Object(_)) => true,
            _ => false,
        };
        if !supported {
            return Err(Error::RenameNotSupported);
        }

        let (abs, _) = self.ensure_open(path).await?;
        let uri = path_to_uri(&abs)?;

        let prepare_supported = rename_capability
            .and_then(|v| v.get("prepareProvider"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if prepare_supported {
            let prepared = self
                .request("textDocument/prepareRename", json!({
                    "textDocument": { "uri": uri },
                    "position": position
                }))
                .await;
            match prepared {
                Ok(Value::Null) => {
                    return Err(Error::RenameInvalid(
                        "the symbol at this position cannot be renamed".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(Error::Lsp { message, .. }) => return Err(Error::RenameInvalid(message)),
                Err(other) => return Err(other),
            }
        }

        let value = self
            .request("textDocument/rename", json!({
                "textDocument": { "uri": uri },
                "position": position,
                "newName": new_name
            }))
            .await?;
        normalize_workspace_edit(value)
    }

    /// Converge the server's view of `path` with disk. Called by the edit
    /// engine after every write, and implicitly before every request.
    pub async fn sync_file(&self, path: &Path) -> Result<()> {
        self.ensure_open(path).await?;
        Ok(())
    }

    /// Current didOpen/didChange version of a tracked file, if open.
    pub async fn open_version(&self, path: &Path) -> Option<i32> {
        let abs = path.canonicalize().ok()?;
        self.open_files.lock().await.get(&abs).map(|e| e.version)
    }

    pub async fn close_file(&self, path: &Path) -> Result<()> {
        self.guard_ready()?;
        let abs = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize file path: {path:?}"))?;
        let uri = path_to_uri(&abs)?;
        if let Ok(mut buf) = self.diagnostics.lock() {
            buf.remove(&uri);
        }
        let removed = self.open_files.lock().await.remove(&abs);
        if removed.is_some() {
            self.transport
                .notify("textDocument/didClose", json!({
                    "textDocument": { "uri": uri }
                }))
                .await?;
        }
        Ok(())
    }

    /// Graceful shutdown, then kill as fallback. Releases every tracked
    /// file.
    pub async fn shutdown(&self) -> Result<()> {
        self.state.store(STATE_STOPPING, Ordering::SeqCst);
        let _ = self
            .transport
            .call_with_timeout("shutdown", Value::Null, Duration::from_secs(2))
            .await;
        let _ = self.transport.notify("exit", Value::Null).await;
        self.transport.kill().await;
        self.open_files.lock().await.clear();
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        Ok(())
    }

    fn guard_ready(&self) -> Result<()> {
        match self.state() {
            ServerState::Ready => Ok(()),
            other => Err(Error::ServerDown(format!(
                "{} is {other:?}",
                self.ls_id
            ))),
        }
    }

    /// Open-or-sync: before any position-based request the file must be
    /// open at its current on-disk content. Returns the canonical path and
    /// the content hash the server now agrees on.
    async fn ensure_open(&self, path: &Path) -> Result<(PathBuf, String)> {
        self.guard_ready()?;

        let abs = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize file path: {path:?}"))?;
        let bytes = tokio::fs::read(&abs)
            .await
            .with_context(|| format!("failed to read file: {abs:?}"))?;
        let hash = sha256_hex(&bytes);
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::InvalidInput(format!("{abs:?} is not valid UTF-8")))?;

        let mut open = self.open_files.lock().await;
        match open.get_mut(&abs) {
            None => {
                let uri = path_to_uri(&abs)?;
                debug!("didOpen {abs:?}");
                self.note(self.transport.notify("textDocument/didOpen", json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": self.language.id(),
                        "version": 1,
                        "text": text
                    }
                }))
                .await)?;
                open.insert(
                    abs.clone(),
                    FileEntry {
                        version: 1,
                        content_hash: hash.clone(),
                    },
                );
            }
            Some(entry) if entry.content_hash != hash => {
                entry.version += 1;
                entry.content_hash = hash.clone();
                let version = entry.version;
                let uri = path_to_uri(&abs)?;
                debug!("didChange {abs:?} version={version}");
                self.note(self.transport.notify("textDocument/didChange", json!({
                    "textDocument": { "uri": uri, "version": version },
                    "contentChanges": [ { "text": text } ]
                }))
                .await)?;
            }
            Some(_) => {}
        }
        Ok((abs, hash))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.guard_ready()?;
        self.note(self.transport.call(method, params).await)
    }

    /// Record transport loss: once the pipe is gone the server is dead for
    /// every caller until the project is reactivated.
    fn note<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::TransportClosed) = &result {
            self.state.store(STATE_FAILED, Ordering::SeqCst);
        }
        result
    }
}
