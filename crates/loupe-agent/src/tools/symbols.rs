use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use loupe_core::symbols::SymbolKind;
use loupe_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Duration;

use crate::Agent;
use crate::retriever::FindOptions;
use crate::tools::{INDEXING_TOOL_TIMEOUT, Tool};

pub fn core_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(FindSymbolTool),
        Arc::new(FindReferencingSymbolsTool),
        Arc::new(GetSymbolsOverviewTool),
        Arc::new(ReplaceSymbolBodyTool),
        Arc::new(InsertBeforeSymbolTool),
        Arc::new(InsertAfterSymbolTool),
        Arc::new(RenameSymbolTool),
    ]
}

fn decode<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|err| Error::InvalidInput(format!("invalid arguments for {tool}: {err}")))
}

fn parse_kinds(raw: Option<Vec<String>>) -> Result<Option<HashSet<SymbolKind>>> {
    let Some(raw) = raw else { return Ok(None) };
    let mut kinds = HashSet::new();
    for name in raw {
        let kind = name.parse::<SymbolKind>().map_err(Error::InvalidInput)?;
        kinds.insert(kind);
    }
    Ok(Some(kinds))
}

struct FindSymbolTool;

#[derive(Debug, Deserialize)]
struct FindSymbolArgs {
    name_path: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    substring: Option<bool>,
    #[serde(default)]
    kinds: Option<Vec<String>>,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    max_depth: Option<usize>,
    #[serde(default)]
    include_body: Option<bool>,
}

#[async_trait]
impl Tool for FindSymbolTool {
    fn name(&self) -> &'static str {
        "find_symbol"
    }

    fn description(&self) -> &'static str {
        "Find symbols by name path (e.g. `Calc/add`) in a file or directory scope"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name_path": {
                    "type": "string",
                    "description": "Slash-separated symbol path; a leading `/` anchors at the file top level"
                },
                "scope": {
                    "type": "string",
                    "description": "File or directory to search, relative to the project root. Defaults to the whole project."
                },
                "substring": {
                    "type": "boolean",
                    "description": "Substring match on the final path segment",
                    "default": false
                },
                "kinds": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Restrict to symbol kinds (e.g. class, method, function)"
                },
                "max_results": {"type": "integer", "minimum": 1},
                "max_depth": {"type": "integer", "minimum": 1},
                "include_body": {
                    "type": "boolean",
                    "description": "Attach each symbol's source text",
                    "default": false
                }
            },
            "required": ["name_path"],
            "additionalProperties": false
        })
    }

    fn timeout(&self) -> Duration {
        INDEXING_TOOL_TIMEOUT
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: FindSymbolArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;

        let opts = FindOptions {
            substring_match: args.substring.unwrap_or(false),
            kinds: parse_kinds(args.kinds)?,
            max_results: args.max_results.unwrap_or(50).clamp(1, 500),
            max_depth: args.max_depth,
            include_body: args.include_body.unwrap_or(false),
        };
        let scope = PathBuf::from(args.scope.unwrap_or_else(|| ".".to_string()));
        let hits = retriever
            .find_by_name(&args.name_path, &scope, &opts)
            .await?;

        Ok(json!({
            "name_path": args.name_path,
            "count": hits.len(),
            "matches": hits,
        }))
    }
}

struct FindReferencingSymbolsTool;

#[derive(Debug, Deserialize)]
struct FindReferencingSymbolsArgs {
    name_path: String,
    path: String,
}

#[async_trait]
impl Tool for FindReferencingSymbolsTool {
    fn name(&self) -> &'static str {
        "find_referencing_symbols"
    }

    fn description(&self) -> &'static str {
        "List code locations referencing a symbol, resolved to their enclosing symbols"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name_path": {"type": "string"},
                "path": {"type": "string", "description": "File declaring the symbol"}
            },
            "required": ["name_path", "path"],
            "additionalProperties": false
        })
    }

    fn timeout(&self) -> Duration {
        INDEXING_TOOL_TIMEOUT
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: FindReferencingSymbolsArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;
        let references = retriever
            .find_referencing_symbols(&args.name_path, &PathBuf::from(&args.path))
            .await?;
        Ok(json!({
            "name_path": args.name_path,
            "count": references.len(),
            "references": references,
        }))
    }
}

struct GetSymbolsOverviewTool;

#[derive(Debug, Deserialize)]
struct GetSymbolsOverviewArgs {
    path: String,
}

#[async_trait]
impl Tool for GetSymbolsOverviewTool {
    fn name(&self) -> &'static str {
        "get_symbols_overview"
    }

    fn description(&self) -> &'static str {
        "Summarize the top-level symbols of a file or directory"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File or directory to summarize"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn timeout(&self) -> Duration {
        INDEXING_TOOL_TIMEOUT
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: GetSymbolsOverviewArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;
        let rows = retriever.overview(&PathBuf::from(&args.path)).await?;
        Ok(json!({
            "path": args.path,
            "count": rows.len(),
            "symbols": rows,
        }))
    }
}

struct ReplaceSymbolBodyTool;

#[derive(Debug, Deserialize)]
struct ReplaceSymbolBodyArgs {
    name_path: String,
    path: String,
    new_body: String,
}

#[async_trait]
impl Tool for ReplaceSymbolBodyTool {
    fn name(&self) -> &'static str {
        "replace_symbol_body"
    }

    fn description(&self) -> &'static str {
        "Replace a symbol's full source range with new text (written verbatim)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name_path": {"type": "string"},
                "path": {"type": "string"},
                "new_body": {"type": "string"}
            },
            "required": ["name_path", "path", "new_body"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: ReplaceSymbolBodyArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;
        let engine = agent.engine().await?;

        let symbol = retriever
            .resolve_unique(&args.name_path, &PathBuf::from(&args.path))
            .await?;
        let outcome = engine.replace_body(&symbol, &args.new_body).await?;
        Ok(json!({
            "name_path": symbol.name_path,
            "edit": outcome,
        }))
    }
}

struct InsertBeforeSymbolTool;

#[derive(Debug, Deserialize)]
struct InsertArgs {
    name_path: String,
    path: String,
    text: String,
}

#[async_trait]
impl Tool for InsertBeforeSymbolTool {
    fn name(&self) -> &'static str {
        "insert_before_symbol"
    }

    fn description(&self) -> &'static str {
        "Insert text immediately before a symbol's range"
    }

    fn schema(&self) -> Value {
        insert_schema()
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: InsertArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;
        let engine = agent.engine().await?;

        let symbol = retriever
            .resolve_unique(&args.name_path, &PathBuf::from(&args.path))
            .await?;
        let outcome = engine.insert_before(&symbol, &args.text).await?;
        Ok(json!({ "name_path": symbol.name_path, "edit": outcome }))
    }
}

struct InsertAfterSymbolTool;

#[async_trait]
impl Tool for InsertAfterSymbolTool {
    fn name(&self) -> &'static str {
        "insert_after_symbol"
    }

    fn description(&self) -> &'static str {
        "Insert text immediately after a symbol's range"
    }

    fn schema(&self) -> Value {
        insert_schema()
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: InsertArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;
        let engine = agent.engine().await?;

        let symbol = retriever
            .resolve_unique(&args.name_path, &PathBuf::from(&args.path))
            .await?;
        let outcome = engine.insert_after(&symbol, &args.text).await?;
        Ok(json!({ "name_path": symbol.name_path, "edit": outcome }))
    }
}

fn insert_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name_path": {"type": "string"},
            "path": {"type": "string"},
            "text": {"type": "string"}
        },
        "required": ["name_path", "path", "text"],
        "additionalProperties": false
    })
}

struct RenameSymbolTool;

#[derive(Debug, Deserialize)]
struct RenameSymbolArgs {
    name_path: String,
    path: String,
    new_name: String,
}

#[async_trait]
impl Tool for RenameSymbolTool {
    fn name(&self) -> &'static str {
        "rename_symbol"
    }

    fn description(&self) -> &'static str {
        "Rename a symbol across the project via the language server"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name_path": {"type": "string"},
                "path": {"type": "string", "description": "File declaring the symbol"},
                "new_name": {"type": "string"}
            },
            "required": ["name_path", "path", "new_name"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value> {
        let args: RenameSymbolArgs = decode(self.name(), args)?;
        let retriever = agent.retriever().await?;
        let engine = agent.engine().await?;

        let symbol = retriever
            .resolve_unique(&args.name_path, &PathBuf::from(&args.path))
            .await?;
        let outcome = engine.rename(&symbol, &args.new_name).await?;
        Ok(json!({
            "name_path": symbol.name_path,
            "new_name": args.new_name,
            "result": outcome,
        }))
    }
}
