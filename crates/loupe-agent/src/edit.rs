use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use loupe_core::fsio::write_atomic;
use loupe_core::hashing::sha256_hex;
use loupe_core::symbols::Position;
use loupe_core::text_edit::{TextEdit, apply_edits, byte_offset};
use loupe_core::{Error, Result};
use loupe_lsp::uri_to_path;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::manager::LanguageServerManager;
use crate::retriever::ResolvedSymbol;

#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub path: PathBuf,
    pub new_content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameOutcome {
    pub files_modified: Vec<PathBuf>,
}

/// Executes symbol-scoped edits. Per file, the compound sequence
/// `read -> check hash -> splice -> atomic write -> didChange -> evict`
/// runs under a file mutex so interleaved writers cannot leave the server
/// open at a stale version.
pub struct EditEngine {
    manager: Arc<LanguageServerManager>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl EditEngine {
    pub fn new(manager: Arc<LanguageServerManager>) -> Self {
        Self {
            manager,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace `[range.start, range.end)` of the symbol with `new_text`,
    /// written verbatim; leading indentation is the caller's business.
    pub async fn replace_body(
        &self,
        symbol: &ResolvedSymbol,
        new_text: &str,
    ) -> Result<EditOutcome> {
        self.splice(symbol, symbol.range.start, symbol.range.end, new_text)
            .await
    }

    pub async fn insert_before(&self, symbol: &ResolvedSymbol, text: &str) -> Result<EditOutcome> {
        self.splice(symbol, symbol.range.start, symbol.range.start, text)
            .await
    }

    pub async fn insert_after(&self, symbol: &ResolvedSymbol, text: &str) -> Result<EditOutcome> {
        self.splice(symbol, symbol.range.end, symbol.range.end, text)
            .await
    }

    /// Ask the owning server for a rename WorkspaceEdit and apply it,
    /// files in lexical path order; within a file every offset is computed
    /// against the pre-edit content, so edits cannot shift one another.
    /// Best-effort sequential: the first failing file halts the walk and
    /// the error enumerates written and pending files. No rollback is
    /// attempted.
    pub async fn rename(&self, symbol: &ResolvedSymbol, new_name: &str) -> Result<RenameOutcome> {
        // A stale resolution would rename at shifted positions.
        let bytes = tokio::fs::read(&symbol.path)
            .await
            .with_context(|| format!("failed to read {:?}", symbol.path))?;
        if sha256_hex(&bytes) != symbol.content_hash {
            return Err(Error::EditConflict {
                path: symbol.path.clone(),
            });
        }

        let server = self.manager.server_for(&symbol.path).await?;
        let workspace_edit = server
            .rename(&symbol.path, symbol.selection_range.start, new_name)
            .await?;
        if workspace_edit.is_empty() {
            return Err(Error::RenameInvalid(
                "the server produced no edits".to_string(),
            ));
        }

        let mut files: Vec<(PathBuf, Vec<TextEdit>)> = Vec::new();
        for (uri, edits) in workspace_edit.changes {
            let path = uri_to_path(&uri)?;
            files.push((path, edits));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut completed: Vec<PathBuf> = Vec::new();
        for (idx, (path, edits)) in files.iter().enumerate() {
            if let Err(err) = self.apply_file_edits(path, edits).await {
                let pending = files[idx..].iter().map(|(p, _)| p.clone()).collect();
                return Err(Error::PartialEdit {
                    completed,
                    pending,
                    message: err.to_string(),
                });
            }
            completed.push(path.clone());
        }

        Ok(RenameOutcome {
            files_modified: completed,
        })
    }

    async fn splice(
        &self,
        symbol: &ResolvedSymbol,
        from: Position,
        to: Position,
        new_text: &str,
    ) -> Result<EditOutcome> {
        let path = &symbol.path;
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {path:?}"))?;
        if sha256_hex(&bytes) != symbol.content_hash {
            return Err(Error::EditConflict { path: path.clone() });
        }
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::InvalidInput(format!("{path:?} is not valid UTF-8")))?;

        let start = byte_offset(&text, from)?;
        let end = byte_offset(&text, to)?;
        if start > end {
            return Err(Error::InvalidInput(format!(
                "degenerate edit range in {path:?}"
            )));
        }

        let mut updated = String::with_capacity(text.len() + new_text.len());
        updated.push_str(&text[..start]);
        updated.push_str(new_text);
        updated.push_str(&text[end..]);

        write_atomic(path, updated.as_bytes()).await?;
        debug!("edited {path:?} ({} -> {} bytes)", text.len(), updated.len());
        self.resync(path).await?;

        Ok(EditOutcome {
            path: path.clone(),
            new_content_hash: sha256_hex(updated.as_bytes()),
        })
    }

    async fn apply_file_edits(&self, path: &Path, edits: &[TextEdit]) -> Result<()> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {path:?}"))?;
        let updated = apply_edits(&text, edits)?;
        write_atomic(path, updated.as_bytes()).await?;
        self.resync(path).await
    }

    /// Post-write bookkeeping: drop stale cache records, then converge the
    /// server before any later semantic query can run against this file.
    async fn resync(&self, path: &Path) -> Result<()> {
        if let Err(err) = self.manager.cache().evict(path).await {
            warn!("cache eviction failed for {path:?}: {err}");
        }
        let server = self.manager.server_for(path).await?;
        server.sync_file(path).await
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CALC_SOURCE, FakeLs, calc_symbols, python_agent};
    use loupe_lsp::path_to_uri;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    async fn calc_project() -> (TempDir, FakeLs, crate::Agent) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), CALC_SOURCE).unwrap();
        let fake = FakeLs::new();
        fake.set_symbols("/a.py", calc_symbols());
        let agent = python_agent(dir.path(), &fake).await;
        (dir, fake, agent)
    }

    #[tokio::test]
    async fn replace_body_splices_the_range_and_resyncs() {
        let (dir, fake, agent) = calc_project().await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let symbol = retriever
            .resolve_unique("Calc/add", Path::new("a.py"))
            .await
            .unwrap();
        let outcome = engine
            .replace_body(&symbol, "def add(self, a, b): return a + b + 0")
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(
            content,
            "class Calc:\n    def add(self, a, b): return a + b + 0\n    def sub(self, a, b): return a - b\n"
        );
        assert_eq!(
            outcome.new_content_hash,
            loupe_core::hashing::sha256_hex(content.as_bytes())
        );
        // The server was told about the new content before any further
        // semantic request could run. didChange is fire-and-forget, so give
        // the fake a beat to drain it.
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert_eq!(fake.count("textDocument/didChange"), 1);
    }

    #[tokio::test]
    async fn replacing_a_body_with_itself_leaves_bytes_identical() {
        let (dir, _fake, agent) = calc_project().await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let before = std::fs::read(dir.path().join("a.py")).unwrap();
        let symbol = retriever
            .resolve_unique("Calc/add", Path::new("a.py"))
            .await
            .unwrap();
        engine
            .replace_body(&symbol, "def add(self, a, b): return a + b")
            .await
            .unwrap();

        let after = std::fs::read(dir.path().join("a.py")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn stale_resolution_is_an_edit_conflict() {
        let (dir, _fake, agent) = calc_project().await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let symbol = retriever
            .resolve_unique("Calc/add", Path::new("a.py"))
            .await
            .unwrap();

        // External mutation between resolution and write.
        let mutated = "class Calc:\n    def add(self, a): return a\n";
        std::fs::write(dir.path().join("a.py"), mutated).unwrap();

        let err = engine
            .replace_body(&symbol, "def add(self): return 0")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EditConflict { .. }));
        // The file keeps the external content untouched.
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(content, mutated);
    }

    #[tokio::test]
    async fn insertions_land_at_the_range_boundaries() {
        let (dir, fake, agent) = calc_project().await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let symbol = retriever
            .resolve_unique("Calc", Path::new("a.py"))
            .await
            .unwrap();
        engine
            .insert_before(&symbol, "# calculator\n")
            .await
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert!(content.starts_with("# calculator\nclass Calc:\n"));

        // Fresh resolution after the edit; the old one is stale now.
        fake.set_symbols(
            "/a.py",
            json!([
                {
                    "name": "Calc",
                    "kind": 5,
                    "range": {"start": {"line": 1, "character": 0}, "end": {"line": 3, "character": 44}},
                    "selectionRange": {"start": {"line": 1, "character": 6}, "end": {"line": 1, "character": 10}}
                }
            ]),
        );
        let symbol = retriever
            .resolve_unique("Calc", Path::new("a.py"))
            .await
            .unwrap();
        engine.insert_after(&symbol, "\n# end").await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert!(content.ends_with("\n# end\n"));
    }

    #[tokio::test]
    async fn rename_applies_workspace_edit_across_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def get_user_data(): pass\n").unwrap();
        std::fs::write(
            dir.path().join("b.py"),
            "from a import get_user_data\nget_user_data()\n",
        )
        .unwrap();
        let a_abs = dir.path().join("a.py").canonicalize().unwrap();
        let b_abs = dir.path().join("b.py").canonicalize().unwrap();

        let fake = FakeLs::new();
        fake.set_symbols(
            "/a.py",
            json!([
                {
                    "name": "get_user_data",
                    "kind": 12,
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 25}},
                    "selectionRange": {"start": {"line": 0, "character": 4}, "end": {"line": 0, "character": 17}}
                }
            ]),
        );
        let span = |line: u32, start: u32| {
            json!({"start": {"line": line, "character": start},
                   "end": {"line": line, "character": start + 13}})
        };
        fake.set_rename_edit(json!({
            "changes": {
                (path_to_uri(&a_abs).unwrap()): [
                    {"range": span(0, 4), "newText": "get_user_info"}
                ],
                (path_to_uri(&b_abs).unwrap()): [
                    {"range": span(0, 14), "newText": "get_user_info"},
                    {"range": span(1, 0), "newText": "get_user_info"}
                ]
            }
        }));

        let agent = python_agent(dir.path(), &fake).await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let symbol = retriever
            .resolve_unique("get_user_data", Path::new("a.py"))
            .await
            .unwrap();
        let outcome = engine.rename(&symbol, "get_user_info").await.unwrap();

        assert_eq!(outcome.files_modified, vec![a_abs.clone(), b_abs.clone()]);
        assert_eq!(
            std::fs::read_to_string(&a_abs).unwrap(),
            "def get_user_info(): pass\n"
        );
        assert_eq!(
            std::fs::read_to_string(&b_abs).unwrap(),
            "from a import get_user_info\nget_user_info()\n"
        );
        // Both touched files were resynced with the server.
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(fake.count("textDocument/didChange") + fake.count("textDocument/didOpen") >= 2);
    }

    #[tokio::test]
    async fn rename_halting_midway_reports_partial_application() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f(): pass\n").unwrap();
        std::fs::write(dir.path().join("zz.py"), "f()\n").unwrap();
        let a_abs = dir.path().join("a.py").canonicalize().unwrap();
        let zz_abs = dir.path().join("zz.py").canonicalize().unwrap();

        let fake = FakeLs::new();
        fake.set_symbols(
            "/a.py",
            json!([
                {
                    "name": "f",
                    "kind": 12,
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 13}},
                    "selectionRange": {"start": {"line": 0, "character": 4}, "end": {"line": 0, "character": 5}}
                }
            ]),
        );
        fake.set_rename_edit(json!({
            "changes": {
                (path_to_uri(&a_abs).unwrap()): [
                    {"range": {"start": {"line": 0, "character": 4}, "end": {"line": 0, "character": 5}},
                     "newText": "g"}
                ],
                // Out-of-range edit: application fails for this file.
                (path_to_uri(&zz_abs).unwrap()): [
                    {"range": {"start": {"line": 999, "character": 0}, "end": {"line": 999, "character": 1}},
                     "newText": "g"}
                ]
            }
        }));

        let agent = python_agent(dir.path(), &fake).await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let symbol = retriever
            .resolve_unique("f", Path::new("a.py"))
            .await
            .unwrap();
        let err = engine.rename(&symbol, "g").await.unwrap_err();
        match err {
            Error::PartialEdit {
                completed, pending, ..
            } => {
                assert_eq!(completed, vec![a_abs.clone()]);
                assert_eq!(pending, vec![zz_abs.clone()]);
            }
            other => panic!("expected PartialEdit, got {other:?}"),
        }

        // Lexically-first file was written; the failing one is untouched.
        assert_eq!(std::fs::read_to_string(&a_abs).unwrap(), "def g(): pass\n");
        assert_eq!(std::fs::read_to_string(&zz_abs).unwrap(), "f()\n");
    }

    #[tokio::test]
    async fn rename_with_stale_origin_is_an_edit_conflict() {
        let (dir, _fake, agent) = calc_project().await;
        let retriever = agent.retriever().await.unwrap();
        let engine = agent.engine().await.unwrap();

        let symbol = retriever
            .resolve_unique("Calc", Path::new("a.py"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("a.py"), "class Other: pass\n").unwrap();

        let err = engine.rename(&symbol, "Calculator").await.unwrap_err();
        assert!(matches!(err, Error::EditConflict { .. }));
    }
}
