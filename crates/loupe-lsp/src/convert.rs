use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use loupe_core::Result;
use loupe_core::symbols::{Location, Range, SymbolId, SymbolKind, SymbolTree};
use loupe_core::text_edit::TextEdit;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDocumentSymbol {
    name: String,
    kind: u32,
    range: Range,
    selection_range: Range,
    #[serde(default)]
    children: Vec<WireDocumentSymbol>,
}

#[derive(Debug, Deserialize)]
struct WireSymbolInformation {
    name: String,
    kind: u32,
    location: Location,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocationLink {
    target_uri: String,
    target_selection_range: Range,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTextDocumentEdit {
    text_document: WireTextDocumentId,
    edits: Vec<TextEdit>,
}

#[derive(Debug, Deserialize)]
struct WireTextDocumentId {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireWorkspaceEdit {
    #[serde(default)]
    changes: Option<BTreeMap<String, Vec<TextEdit>>>,
    #[serde(default)]
    document_changes: Option<Vec<Value>>,
}

/// Multi-file edit description, uri -> ordered edits. A `BTreeMap` keeps
/// file application order deterministic (lexical by uri).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceEdit {
    pub changes: BTreeMap<String, Vec<TextEdit>>,
}

impl WorkspaceEdit {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Convert a `textDocument/documentSymbol` response into the uniform
/// hierarchical tree. Servers return either `DocumentSymbol[]`
/// (hierarchical) or `SymbolInformation[]` (flat); the flat shape gets its
/// parenthood synthesized from range containment.
pub fn symbol_tree_from_response(value: Value) -> Result<SymbolTree> {
    if value.is_null() {
        return Ok(SymbolTree::new());
    }
    let Some(arr) = value.as_array() else {
        return Err(anyhow!("documentSymbol response is not an array").into());
    };
    if arr.is_empty() {
        return Ok(SymbolTree::new());
    }

    // DocumentSymbol is recognizable by its selectionRange member.
    let hierarchical = arr[0].get("selectionRange").is_some();
    if hierarchical {
        let roots: Vec<WireDocumentSymbol> =
            serde_json::from_value(Value::Array(arr.clone()))
                .context("failed to parse DocumentSymbol[]")?;
        let mut tree = SymbolTree::new();
        for root in &roots {
            add_document_symbol(&mut tree, root, None);
        }
        return Ok(tree);
    }

    let infos: Vec<WireSymbolInformation> = serde_json::from_value(Value::Array(arr.clone()))
        .context("failed to parse SymbolInformation[]")?;
    Ok(tree_from_flat(infos))
}

fn add_document_symbol(tree: &mut SymbolTree, sym: &WireDocumentSymbol, parent: Option<SymbolId>) {
    let Ok(kind) = SymbolKind::try_from(sym.kind) else {
        debug!("skipping symbol '{}' with unknown kind {}", sym.name, sym.kind);
        return;
    };
    // Some servers report a selection range that leaks outside the full
    // range; clamp it so the tree invariants hold.
    let selection = if sym.range.contains_range(&sym.selection_range) {
        sym.selection_range
    } else {
        sym.range
    };
    let id = tree.push(sym.name.clone(), kind, sym.range, selection, parent);
    for child in &sym.children {
        add_document_symbol(tree, child, Some(id));
    }
}

fn tree_from_flat(mut infos: Vec<WireSymbolInformation>) -> SymbolTree {
    // Sort outermost-first so a containment stack recovers nesting.
    infos.sort_by(|a, b| {
        a.location
            .range
            .start
            .cmp(&b.location.range.start)
            .then_with(|| b.location.range.end.cmp(&a.location.range.end))
    });

    let mut tree = SymbolTree::new();
    let mut stack: Vec<(SymbolId, Range)> = Vec::new();
    for info in infos {
        let Ok(kind) = SymbolKind::try_from(info.kind) else {
            debug!(
                "skipping symbol '{}' with unknown kind {}",
                info.name, info.kind
            );
            continue;
        };
        let range = info.location.range;
        while let Some((_, top)) = stack.last() {
            if top.contains_range(&range) && *top != range {
                break;
            }
            stack.pop();
        }
        let parent = stack.last().map(|(id, _)| *id);
        let id = tree.push(info.name, kind, range, range, parent);
        stack.push((id, range));
    }
    tree
}

/// `textDocument/definition` and friends answer with `Location`,
/// `Location[]`, `LocationLink[]` or null.
pub fn parse_locations(value: Value) -> Result<Vec<Location>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let items: Vec<Value> = if let Some(arr) = value.as_array() {
        arr.clone()
    } else if value.is_object() {
        vec![value]
    } else {
        return Err(anyhow!("location response is neither array nor object").into());
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(parse_location(&item)?);
    }
    Ok(out)
}

fn parse_location(value: &Value) -> Result<Location> {
    if value.get("uri").is_some() {
        let loc: Location =
            serde_json::from_value(value.clone()).context("failed to parse Location")?;
        return Ok(loc);
    }
    if value.get("targetUri").is_some() {
        let link: WireLocationLink =
            serde_json::from_value(value.clone()).context("failed to parse LocationLink")?;
        return Ok(Location {
            uri: link.target_uri,
            range: link.target_selection_range,
        });
    }
    Err(anyhow!("unknown location shape").into())
}

/// Flatten a `WorkspaceEdit` response. Both the `changes` map and the
/// `documentChanges` list occur in the wild; resource operations (create,
/// rename, delete) are skipped.
pub fn normalize_workspace_edit(value: Value) -> Result<WorkspaceEdit> {
    let wire: WireWorkspaceEdit =
        serde_json::from_value(value).context("failed to parse WorkspaceEdit")?;
    let mut changes = wire.changes.unwrap_or_default();

    for change in wire.document_changes.unwrap_or_default() {
        let is_text_edit = change.get("textDocument").is_some() && change.get("edits").is_some();
        if !is_text_edit {
            continue;
        }
        let tde: WireTextDocumentEdit = serde_json::from_value(change)
            .context("failed to parse TextDocumentEdit in WorkspaceEdit")?;
        changes
            .entry(tde.text_document.uri)
            .or_default()
            .extend(tde.edits);
    }

    Ok(WorkspaceEdit { changes })
}

pub fn path_to_uri(path: &Path) -> Result<String> {
    Url::from_file_path(path)
        .map_err(|_| anyhow!("failed to convert path to file URI: {path:?}"))
        .map(|u| u.to_string())
        .map_err(Into::into)
}

pub fn uri_to_path(uri: &str) -> Result<PathBuf> {
    let url = Url::parse(uri).with_context(|| format!("invalid URI: {uri}"))?;
    if url.scheme() != "file" {
        return Err(anyhow!("unsupported URI scheme: {}", url.scheme()).into());
    }
    url.to_file_path()
        .map_err(|_| anyhow!("failed to convert URI to path: {uri}").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loupe_core::symbols::{MatchOptions, NamePath, Position};
    use serde_json::json;

    #[test]
    fn hierarchical_response_builds_nested_tree() {
        let value = json!([
            {
                "name": "Calc",
                "kind": 5,
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 3, "character": 0}},
                "selectionRange": {"start": {"line": 0, "character": 6}, "end": {"line": 0, "character": 10}},
                "children": [
                    {
                        "name": "add",
                        "kind": 6,
                        "range": {"start": {"line": 1, "character": 4}, "end": {"line": 1, "character": 40}},
                        "selectionRange": {"start": {"line": 1, "character": 8}, "end": {"line": 1, "character": 11}}
                    }
                ]
            }
        ]);

        let tree = symbol_tree_from_response(value).unwrap();
        assert!(tree.validate().is_ok());
        assert_eq!(tree.len(), 2);

        let path = NamePath::parse("Calc/add").unwrap();
        let hits = tree.find_by_name_path(&path, &MatchOptions::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(tree.get(hits[0]).kind, SymbolKind::Method);
    }

    #[test]
    fn flat_response_synthesizes_parenthood_from_containment() {
        let value = json!([
            {
                "name": "add",
                "kind": 6,
                "location": {
                    "uri": "file:///ws/a.py",
                    "range": {"start": {"line": 1, "character": 4}, "end": {"line": 1, "character": 40}}
                }
            },
            {
                "name": "Calc",
                "kind": 5,
                "location": {
                    "uri": "file:///ws/a.py",
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 3, "character": 0}}
                }
            },
            {
                "name": "standalone",
                "kind": 12,
                "location": {
                    "uri": "file:///ws/a.py",
                    "range": {"start": {"line": 5, "character": 0}, "end": {"line": 6, "character": 0}}
                }
            }
        ]);

        let tree = symbol_tree_from_response(value).unwrap();
        assert!(tree.validate().is_ok());
        assert_eq!(tree.roots().len(), 2);

        let path = NamePath::parse("Calc/add").unwrap();
        let hits = tree.find_by_name_path(&path, &MatchOptions::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(tree.name_path_of(hits[0]), "/Calc/add");
    }

    #[test]
    fn null_and_empty_responses_are_empty_trees() {
        assert!(symbol_tree_from_response(Value::Null).unwrap().is_empty());
        assert!(symbol_tree_from_response(json!([])).unwrap().is_empty());
        assert!(symbol_tree_from_response(json!("nope")).is_err());
    }

    #[test]
    fn selection_range_is_clamped_into_range() {
        let value = json!([
            {
                "name": "odd",
                "kind": 12,
                "range": {"start": {"line": 1, "character": 0}, "end": {"line": 2, "character": 0}},
                "selectionRange": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}}
            }
        ]);
        let tree = symbol_tree_from_response(value).unwrap();
        assert!(tree.validate().is_ok());
        let root = tree.roots()[0];
        assert_eq!(tree.get(root).selection_range, tree.get(root).range);
    }

    #[test]
    fn parse_locations_accepts_all_shapes() {
        let range = json!({"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}});
        assert!(parse_locations(Value::Null).unwrap().is_empty());

        let single = json!({"uri": "file:///ws/a.py", "range": range});
        let locs = parse_locations(single).unwrap();
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].uri, "file:///ws/a.py");

        let links = json!([{
            "targetUri": "file:///ws/b.py",
            "targetRange": {"start": {"line": 0, "character": 0}, "end": {"line": 9, "character": 0}},
            "targetSelectionRange": range
        }]);
        let locs = parse_locations(links).unwrap();
        assert_eq!(locs[0].uri, "file:///ws/b.py");
        assert_eq!(locs[0].range.end, Position::new(0, 3));
    }

    #[test]
    fn workspace_edit_changes_and_document_changes_merge() {
        let edit = |text: &str| {
            json!({
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
                "newText": text
            })
        };
        let value = json!({
            "changes": { "file:///ws/a.py": [edit("x")] },
            "documentChanges": [
                { "textDocument": {"uri": "file:///ws/b.py", "version": 3}, "edits": [edit("y")] },
                { "kind": "rename", "oldUri": "file:///ws/c.py", "newUri": "file:///ws/d.py" }
            ]
        });

        let ws = normalize_workspace_edit(value).unwrap();
        assert_eq!(ws.changes.len(), 2);
        assert_eq!(ws.changes["file:///ws/a.py"][0].new_text, "x");
        assert_eq!(ws.changes["file:///ws/b.py"][0].new_text, "y");

        // BTreeMap iteration is lexical by uri.
        let keys: Vec<&String> = ws.changes.keys().collect();
        assert_eq!(keys, vec!["file:///ws/a.py", "file:///ws/b.py"]);
    }

    #[test]
    fn uri_path_round_trip() {
        let path = PathBuf::from("/ws/src/a.py");
        let uri = path_to_uri(&path).unwrap();
        assert_eq!(uri, "file:///ws/src/a.py");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
        assert!(uri_to_path("https://example.com/a.py").is_err());
    }
}
