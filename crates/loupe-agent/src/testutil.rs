//! Scripted in-process language server for agent tests, attached over a
//! duplex pipe instead of a subprocess.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use loupe_core::cache::SymbolCache;
use loupe_core::lang::Language;
use loupe_lsp::{
    LanguageServer, LanguageServerOptions, Transport, default_server_request_policy, read_frame,
    write_frame,
};
use serde_json::{Value, json};
use tokio::io::{BufReader, duplex, split};
use tokio::time::Duration;

use crate::{Agent, ServerRegistry};

#[derive(Clone, Default)]
pub(crate) struct FakeLs {
    /// uri-suffix -> documentSymbol result.
    symbols: Arc<StdMutex<Vec<(String, Value)>>>,
    references: Arc<StdMutex<Value>>,
    rename_edit: Arc<StdMutex<Value>>,
    pub(crate) seen: Arc<StdMutex<Vec<String>>>,
}

impl FakeLs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_symbols(&self, uri_suffix: &str, value: Value) {
        let mut table = self.symbols.lock().unwrap();
        table.retain(|(suffix, _)| suffix != uri_suffix);
        table.push((uri_suffix.to_string(), value));
    }

    pub(crate) fn set_references(&self, value: Value) {
        *self.references.lock().unwrap() = value;
    }

    pub(crate) fn set_rename_edit(&self, value: Value) {
        *self.rename_edit.lock().unwrap() = value;
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|m| *m == method)
            .count()
    }

    /// Start the scripted responder and hand back a ready LanguageServer
    /// wired to it.
    pub(crate) async fn attach(&self, root: &Path, cache: Arc<SymbolCache>) -> Arc<LanguageServer> {
        let (client_io, server_io) = duplex(1024 * 1024);
        let (client_read, client_write) = split(client_io);
        let (server_read, server_write) = split(server_io);

        let symbols = self.symbols.clone();
        let references = self.references.clone();
        let rename_edit = self.rename_edit.clone();
        let seen = self.seen.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut writer = server_write;
            while let Ok(Some(frame)) = read_frame(&mut reader).await {
                let Some(method) = frame.get("method").and_then(|m| m.as_str()) else {
                    continue;
                };
                seen.lock().unwrap().push(method.to_string());
                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                let result = match method {
                    "initialize" => json!({
                        "capabilities": { "renameProvider": true }
                    }),
                    "textDocument/documentSymbol" => {
                        let uri = frame["params"]["textDocument"]["uri"]
                            .as_str()
                            .unwrap_or("")
                            .to_string();
                        let table = symbols.lock().unwrap();
                        table
                            .iter()
                            .find(|(suffix, _)| uri.ends_with(suffix))
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null)
                    }
                    "textDocument/references" => references.lock().unwrap().clone(),
                    "textDocument/rename" => rename_edit.lock().unwrap().clone(),
                    _ => Value::Null,
                };
                let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                if write_frame(&mut writer, &response).await.is_err() {
                    break;
                }
            }
        });

        let transport = Transport::attach(
            client_read,
            client_write,
            Duration::from_secs(2),
            default_server_request_policy("file:///ws/".to_string()),
        );
        let server = LanguageServer::attach(
            transport,
            LanguageServerOptions {
                ls_id: "fake-pyls".to_string(),
                language: Language::Python,
                command: String::new(),
                args: Vec::new(),
                workspace_root: root.to_path_buf(),
                initialize_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(2),
                initialize_options: None,
            },
            cache,
        )
        .await
        .expect("fake language server handshake failed");
        Arc::new(server)
    }
}

/// Agent with an activated project whose Python traffic is served by the
/// fake.
pub(crate) async fn python_agent(root: &Path, fake: &FakeLs) -> Agent {
    let agent = Agent::new(ServerRegistry::builtin());
    agent.activate_project(root).await.unwrap();
    let manager = agent.manager().await.unwrap();
    let server = fake.attach(root, manager.cache().clone()).await;
    manager.adopt(Language::Python, server).await;
    agent
}

/// Hierarchical documentSymbol payload for the canonical two-method
/// calculator fixture.
pub(crate) fn calc_symbols() -> Value {
    json!([
        {
            "name": "Calc",
            "kind": 5,
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 2, "character": 44}},
            "selectionRange": {"start": {"line": 0, "character": 6}, "end": {"line": 0, "character": 10}},
            "children": [
                {
                    "name": "add",
                    "kind": 6,
                    "range": {"start": {"line": 1, "character": 4}, "end": {"line": 1, "character": 44}},
                    "selectionRange": {"start": {"line": 1, "character": 8}, "end": {"line": 1, "character": 11}}
                },
                {
                    "name": "sub",
                    "kind": 6,
                    "range": {"start": {"line": 2, "character": 4}, "end": {"line": 2, "character": 44}},
                    "selectionRange": {"start": {"line": 2, "character": 8}, "end": {"line": 2, "character": 11}}
                }
            ]
        }
    ])
}

pub(crate) const CALC_SOURCE: &str = "class Calc:\n    def add(self, a, b): return a + b\n    def sub(self, a, b): return a - b\n";
