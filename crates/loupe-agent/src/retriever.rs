use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use loupe_core::symbols::{MatchOptions, NamePath, Range, SymbolKind};
use loupe_core::text_edit::byte_offset;
use loupe_core::{Error, Result};
use loupe_lsp::uri_to_path;
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::manager::LanguageServerManager;

/// Options for [`SymbolRetriever::find_by_name`].
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub substring_match: bool,
    pub kinds: Option<HashSet<SymbolKind>>,
    pub max_results: usize,
    pub max_depth: Option<usize>,
    /// Attach the exact source slice of each hit's range.
    pub include_body: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            substring_match: false,
            kinds: None,
            max_results: 50,
            max_depth: None,
            include_body: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolHit {
    pub path: PathBuf,
    pub name_path: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub selection_range: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnclosingSymbol {
    pub name_path: String,
    pub kind: SymbolKind,
    pub range: Range,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceHit {
    pub path: PathBuf,
    pub range: Range,
    /// Smallest symbol whose range covers the reference, when the file has
    /// a symbol tree at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclosing: Option<EnclosingSymbol>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewRow {
    pub path: PathBuf,
    pub name_path: String,
    pub kind: SymbolKind,
}

/// A symbol pinned to the file content it was resolved against. Edits
/// check `content_hash` before touching the file, so stale resolutions
/// surface as conflicts instead of corrupting code.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSymbol {
    pub path: PathBuf,
    pub name_path: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub selection_range: Range,
    pub content_hash: String,
}

/// High-level, language-agnostic symbol queries over the active project.
pub struct SymbolRetriever {
    manager: Arc<LanguageServerManager>,
}

impl std::fmt::Debug for SymbolRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolRetriever").finish_non_exhaustive()
    }
}

impl SymbolRetriever {
    pub fn new(manager: Arc<LanguageServerManager>) -> Self {
        Self { manager }
    }

    /// Search for `name_path` under `scope` (a file or directory inside
    /// the project). Files are visited in lexical path order, which also
    /// breaks ties between equally specific hits.
    pub async fn find_by_name(
        &self,
        name_path: &str,
        scope: &Path,
        opts: &FindOptions,
    ) -> Result<Vec<SymbolHit>> {
        let parsed = NamePath::parse(name_path)?;
        let files = self.candidate_files(scope).await?;

        let mut hits: Vec<SymbolHit> = Vec::new();
        for file in files {
            if hits.len() >= opts.max_results {
                break;
            }
            let server = self.manager.server_for(&file).await?;
            let symbols = server.document_symbols(&file).await?;

            let match_opts = MatchOptions {
                substring_match: opts.substring_match,
                kinds: opts.kinds.clone(),
                max_results: Some(opts.max_results - hits.len()),
                max_depth: opts.max_depth,
            };
            let ids = symbols.tree.find_by_name_path(&parsed, &match_opts);
            if ids.is_empty() {
                continue;
            }

            let text = if opts.include_body {
                Some(
                    tokio::fs::read_to_string(&file)
                        .await
                        .with_context(|| format!("failed to read {file:?}"))?,
                )
            } else {
                None
            };
            for id in ids {
                let node = symbols.tree.get(id);
                let body = text.as_deref().and_then(|t| slice_range(t, node.range));
                hits.push(SymbolHit {
                    path: file.clone(),
                    name_path: symbols.tree.name_path_of(id),
                    kind: node.kind,
                    range: node.range,
                    selection_range: node.selection_range,
                    body,
                });
            }
        }
        Ok(hits)
    }

    /// Resolve `name_path` in `path` to exactly one symbol, pinned to the
    /// file's current content hash.
    pub async fn resolve_unique(&self, name_path: &str, path: &Path) -> Result<ResolvedSymbol> {
        let parsed = NamePath::parse(name_path)?;
        let abs = self.resolve_in_project(path)?;
        if !abs.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not a file",
                abs.display()
            )));
        }

        let server = self.manager.server_for(&abs).await?;
        let symbols = server.document_symbols(&abs).await?;
        let ids = symbols
            .tree
            .find_by_name_path(&parsed, &MatchOptions::default());
        match ids.as_slice() {
            [] => Err(Error::SymbolNotFound(format!(
                "{name_path} in {}",
                abs.display()
            ))),
            [id] => {
                let node = symbols.tree.get(*id);
                Ok(ResolvedSymbol {
                    path: abs.clone(),
                    name_path: symbols.tree.name_path_of(*id),
                    kind: node.kind,
                    range: node.range,
                    selection_range: node.selection_range,
                    content_hash: symbols.content_hash,
                })
            }
            many => Err(Error::AmbiguousSymbol {
                name_path: name_path.to_string(),
                count: many.len(),
            }),
        }
    }

    /// References to the symbol at `name_path` in `path`, each resolved to
    /// its enclosing symbol in the referencing file.
    pub async fn find_referencing_symbols(
        &self,
        name_path: &str,
        path: &Path,
    ) -> Result<Vec<ReferenceHit>> {
        let target = self.resolve_unique(name_path, path).await?;
        let server = self.manager.server_for(&target.path).await?;
        let locations = server
            .references(&target.path, target.selection_range.start, false)
            .await?;

        let mut by_file: BTreeMap<PathBuf, Vec<Range>> = BTreeMap::new();
        for location in locations {
            match uri_to_path(&location.uri) {
                Ok(p) => by_file.entry(p).or_default().push(location.range),
                Err(err) => debug!("skipping non-file reference {}: {err}", location.uri),
            }
        }

        let mut out = Vec::new();
        for (file, ranges) in by_file {
            let symbols = match self.manager.server_for(&file).await {
                Ok(server) => Some(server.document_symbols(&file).await?),
                Err(Error::UnsupportedLanguage { .. }) => None,
                Err(err) => return Err(err),
            };
            for range in ranges {
                let enclosing = symbols.as_ref().and_then(|s| {
                    s.tree.smallest_enclosing(range.start).map(|id| {
                        let node = s.tree.get(id);
                        EnclosingSymbol {
                            name_path: s.tree.name_path_of(id),
                            kind: node.kind,
                            range: node.range,
                        }
                    })
                });
                out.push(ReferenceHit {
                    path: file.clone(),
                    range,
                    enclosing,
                });
            }
        }
        Ok(out)
    }

    /// Top-level and one-level-deep symbols of a file; for a directory,
    /// top-level symbols per contained file.
    pub async fn overview(&self, path: &Path) -> Result<Vec<OverviewRow>> {
        let abs = self.resolve_in_project(path)?;

        if abs.is_file() {
            let server = self.manager.server_for(&abs).await?;
            let symbols = server.document_symbols(&abs).await?;
            let mut rows = Vec::new();
            for &root in symbols.tree.roots() {
                rows.push(OverviewRow {
                    path: abs.clone(),
                    name_path: symbols.tree.name_path_of(root),
                    kind: symbols.tree.get(root).kind,
                });
                for &child in &symbols.tree.get(root).children {
                    rows.push(OverviewRow {
                        path: abs.clone(),
                        name_path: symbols.tree.name_path_of(child),
                        kind: symbols.tree.get(child).kind,
                    });
                }
            }
            return Ok(rows);
        }

        let mut rows = Vec::new();
        for file in self.candidate_files(&abs).await? {
            let server = self.manager.server_for(&file).await?;
            let symbols = server.document_symbols(&file).await?;
            for &root in symbols.tree.roots() {
                rows.push(OverviewRow {
                    path: file.clone(),
                    name_path: symbols.tree.name_path_of(root),
                    kind: symbols.tree.get(root).kind,
                });
            }
        }
        Ok(rows)
    }

    /// Enumerate candidate files under `scope`: a single supported file,
    /// or a directory walk skipping hidden entries and unsupported
    /// languages, sorted lexically.
    async fn candidate_files(&self, scope: &Path) -> Result<Vec<PathBuf>> {
        let abs = self.resolve_in_project(scope)?;

        if abs.is_file() {
            if !self.manager.supports(&abs) {
                return Err(Error::UnsupportedLanguage { path: abs });
            }
            return Ok(vec![abs]);
        }
        if !abs.is_dir() {
            return Err(Error::InvalidInput(format!(
                "scope does not exist: {}",
                abs.display()
            )));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&abs)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| self.manager.supports(p))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Anchor relative paths at the project root and refuse escapes.
    fn resolve_in_project(&self, path: &Path) -> Result<PathBuf> {
        let root = self.manager.project_root();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let abs = joined
            .canonicalize()
            .with_context(|| format!("path does not exist: {}", joined.display()))?;
        if !abs.starts_with(root) {
            return Err(Error::InvalidInput(format!(
                "{} is outside the project root",
                abs.display()
            )));
        }
        Ok(abs)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn slice_range(text: &str, range: Range) -> Option<String> {
    let start = byte_offset(text, range.start).ok()?;
    let end = byte_offset(text, range.end).ok()?;
    if start > end || end > text.len() {
        return None;
    }
    Some(text[start..end].to_string())
}
