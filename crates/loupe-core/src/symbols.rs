use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Zero-based position. `character` counts UTF-16 code units within the
/// line, matching the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open `[start, end)` range of positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn contains_position(&self, pos: Position) -> bool {
        self.start <= pos && pos < self.end
    }

    /// `other` lies within `self` (boundaries may coincide).
    pub fn contains_range(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// The closed LSP symbol-kind set, serialized as its protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum SymbolKind {
    File = 1,
    Module = 2,
    Namespace = 3,
    Package = 4,
    Class = 5,
    Method = 6,
    Property = 7,
    Field = 8,
    Constructor = 9,
    Enum = 10,
    Interface = 11,
    Function = 12,
    Variable = 13,
    Constant = 14,
    String = 15,
    Number = 16,
    Boolean = 17,
    Array = 18,
    Object = 19,
    Key = 20,
    Null = 21,
    EnumMember = 22,
    Struct = 23,
    Event = 24,
    Operator = 25,
    TypeParameter = 26,
}

impl SymbolKind {
    pub fn name(&self) -> &'static str {
        match self {
            SymbolKind::File => "file",
            SymbolKind::Module => "module",
            SymbolKind::Namespace => "namespace",
            SymbolKind::Package => "package",
            SymbolKind::Class => "class",
            SymbolKind::Method => "method",
            SymbolKind::Property => "property",
            SymbolKind::Field => "field",
            SymbolKind::Constructor => "constructor",
            SymbolKind::Enum => "enum",
            SymbolKind::Interface => "interface",
            SymbolKind::Function => "function",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::String => "string",
            SymbolKind::Number => "number",
            SymbolKind::Boolean => "boolean",
            SymbolKind::Array => "array",
            SymbolKind::Object => "object",
            SymbolKind::Key => "key",
            SymbolKind::Null => "null",
            SymbolKind::EnumMember => "enum_member",
            SymbolKind::Struct => "struct",
            SymbolKind::Event => "event",
            SymbolKind::Operator => "operator",
            SymbolKind::TypeParameter => "type_parameter",
        }
    }
}

impl From<SymbolKind> for u32 {
    fn from(kind: SymbolKind) -> u32 {
        kind as u32
    }
}

impl TryFrom<u32> for SymbolKind {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, String> {
        use SymbolKind::*;
        let kind = match value {
            1 => File,
            2 => Module,
            3 => Namespace,
            4 => Package,
            5 => Class,
            6 => Method,
            7 => Property,
            8 => Field,
            9 => Constructor,
            10 => Enum,
            11 => Interface,
            12 => Function,
            13 => Variable,
            14 => Constant,
            15 => String,
            16 => Number,
            17 => Boolean,
            18 => Array,
            19 => Object,
            20 => Key,
            21 => Null,
            22 => EnumMember,
            23 => Struct,
            24 => Event,
            25 => Operator,
            26 => TypeParameter,
            other => return Err(format!("unknown symbol kind: {other}")),
        };
        Ok(kind)
    }
}

impl FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        use SymbolKind::*;
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let kind = match normalized.as_str() {
            "file" => File,
            "module" => Module,
            "namespace" => Namespace,
            "package" => Package,
            "class" => Class,
            "method" => Method,
            "property" => Property,
            "field" => Field,
            "constructor" => Constructor,
            "enum" => Enum,
            "interface" => Interface,
            "function" => Function,
            "variable" => Variable,
            "constant" => Constant,
            "string" => String,
            "number" => Number,
            "boolean" => Boolean,
            "array" => Array,
            "object" => Object,
            "key" => Key,
            "null" => Null,
            "enummember" | "enum_member" => EnumMember,
            "struct" => Struct,
            "event" => Event,
            "operator" => Operator,
            "typeparameter" | "type_parameter" => TypeParameter,
            other => return Err(format!("unknown symbol kind: {other}")),
        };
        Ok(kind)
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type SymbolId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolNode {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub selection_range: Range,
    pub parent: Option<SymbolId>,
    pub children: Vec<SymbolId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
}

/// Per-file symbol tree stored as an arena. Parent links are plain
/// back-indices, never owning references, so the tree stays a single-owner
/// structure while `name_path_of` can still ascend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolTree {
    nodes: Vec<SymbolNode>,
    roots: Vec<SymbolId>,
}

/// Options for [`SymbolTree::find_by_name_path`].
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    /// Substring comparison for the final name-path segment. Earlier
    /// segments are always exact.
    pub substring_match: bool,
    pub kinds: Option<HashSet<SymbolKind>>,
    pub max_results: Option<usize>,
    /// Traversal depth limit; nodes at depth >= max_depth are not visited
    /// (roots are depth 0).
    pub max_depth: Option<usize>,
}

impl SymbolTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: SymbolKind,
        range: Range,
        selection_range: Range,
        parent: Option<SymbolId>,
    ) -> SymbolId {
        let id = self.nodes.len();
        self.nodes.push(SymbolNode {
            name: name.into(),
            kind,
            range,
            selection_range,
            parent,
            children: Vec::new(),
            body_text: None,
        });
        match parent {
            Some(p) => self.nodes[p].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn get(&self, id: SymbolId) -> &SymbolNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut SymbolNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[SymbolId] {
        &self.roots
    }

    /// Pre-order traversal over all roots.
    pub fn preorder(&self) -> impl Iterator<Item = SymbolId> + '_ {
        let mut stack: Vec<SymbolId> = self.roots.iter().rev().copied().collect();
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            stack.extend(self.nodes[id].children.iter().rev());
            Some(id)
        })
    }

    pub fn ancestors(&self, id: SymbolId) -> impl Iterator<Item = SymbolId> + '_ {
        let mut cur = self.nodes[id].parent;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.nodes[id].parent;
            Some(id)
        })
    }

    pub fn descendants(&self, id: SymbolId) -> impl Iterator<Item = SymbolId> + '_ {
        let mut stack: Vec<SymbolId> = self.nodes[id].children.iter().rev().copied().collect();
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            stack.extend(self.nodes[id].children.iter().rev());
            Some(id)
        })
    }

    /// Absolute name path of a symbol. Trees are per-file, so the topmost
    /// ancestor is always a file root and the result carries a leading `/`.
    pub fn name_path_of(&self, id: SymbolId) -> String {
        let mut segments = vec![self.nodes[id].name.as_str()];
        for ancestor in self.ancestors(id) {
            segments.push(self.nodes[ancestor].name.as_str());
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Pre-order name-path search with early termination at `max_results`.
    pub fn find_by_name_path(&self, path: &NamePath, opts: &MatchOptions) -> Vec<SymbolId> {
        let max_results = opts.max_results.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        if max_results == 0 || path.segments.is_empty() {
            return out;
        }

        let mut stack: Vec<(SymbolId, usize)> =
            self.roots.iter().rev().map(|id| (*id, 0usize)).collect();
        while let Some((id, depth)) = stack.pop() {
            if out.len() >= max_results {
                break;
            }

            let node = &self.nodes[id];
            let kind_ok = opts
                .kinds
                .as_ref()
                .map(|kinds| kinds.contains(&node.kind))
                .unwrap_or(true);
            if kind_ok && self.matches_at(id, path, opts.substring_match) {
                out.push(id);
            }

            let descend = opts.max_depth.map(|d| depth + 1 < d).unwrap_or(true);
            if descend {
                stack.extend(node.children.iter().rev().map(|c| (*c, depth + 1)));
            }
        }
        out
    }

    /// A symbol matches `s1/../sn` when its own name matches `sn` and its
    /// parent chain matches the earlier segments exactly. Absolute paths
    /// additionally anchor the `s1` symbol at a tree root.
    fn matches_at(&self, id: SymbolId, path: &NamePath, substring_last: bool) -> bool {
        let segments = &path.segments;
        let node = &self.nodes[id];
        let Some(last) = segments.last() else {
            return false;
        };

        let last_ok = if substring_last {
            node.name.contains(last.as_str())
        } else {
            node.name == *last
        };
        if !last_ok {
            return false;
        }

        let mut cur = node.parent;
        for segment in segments[..segments.len() - 1].iter().rev() {
            match cur {
                Some(parent_id) => {
                    let parent = &self.nodes[parent_id];
                    if parent.name != *segment {
                        return false;
                    }
                    cur = parent.parent;
                }
                None => return false,
            }
        }

        !path.absolute || cur.is_none()
    }

    /// Deepest symbol whose range contains `pos`.
    pub fn smallest_enclosing(&self, pos: Position) -> Option<SymbolId> {
        let mut found = None;
        let mut candidates: Vec<SymbolId> = self.roots.clone();
        while let Some(id) = candidates.pop() {
            if self.nodes[id].range.contains_position(pos) {
                found = Some(id);
                candidates.clear();
                candidates.extend(self.nodes[id].children.iter());
            }
        }
        found
    }

    /// Structural invariants: selection within range, children strictly
    /// inside their parent, siblings pairwise disjoint.
    pub fn validate(&self) -> Result<(), String> {
        for (id, node) in self.nodes.iter().enumerate() {
            if !node.range.contains_range(&node.selection_range) {
                return Err(format!(
                    "symbol #{id} '{}': selection range escapes range",
                    node.name
                ));
            }
            for &child in &node.children {
                let child_node = &self.nodes[child];
                if child_node.parent != Some(id) {
                    return Err(format!("symbol #{child}: broken parent back-reference"));
                }
                if !node.range.contains_range(&child_node.range)
                    || child_node.range == node.range
                {
                    return Err(format!(
                        "symbol #{child} '{}': range not strictly inside parent '{}'",
                        child_node.name, node.name
                    ));
                }
            }
            let mut spans: Vec<Range> =
                node.children.iter().map(|c| self.nodes[*c].range).collect();
            spans.sort_by_key(|r| r.start);
            for pair in spans.windows(2) {
                if pair[1].start < pair[0].end {
                    return Err(format!(
                        "symbol #{id} '{}': sibling ranges overlap",
                        node.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Slash-separated name path. A leading `/` anchors the first segment at
/// the file root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePath {
    pub segments: Vec<String>,
    pub absolute: bool,
}

impl NamePath {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let absolute = raw.starts_with('/');
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let segments: Vec<String> = trimmed
            .split('/')
            .map(str::to_string)
            .collect();
        if trimmed.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidInput(format!("malformed name path: '{raw}'")));
        }
        Ok(Self { segments, absolute })
    }
}

impl fmt::Display for NamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        f.write_str(&self.segments.join("/"))
    }
}
