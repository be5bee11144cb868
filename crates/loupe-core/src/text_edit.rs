use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::symbols::{Position, Range};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

/// Maps zero-based UTF-16 positions onto byte boundaries of one document
/// snapshot.
pub struct LineIndex<'a> {
    text: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(at, _)| at + 1));
        Self { text, starts }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// Byte offset of `pos`. Columns past the end of a line clamp to the
    /// line end; a line past the end of the document is an error.
    pub fn offset(&self, pos: Position) -> Result<usize> {
        let line = pos.line as usize;
        let Some(&start) = self.starts.get(line) else {
            return Err(anyhow!(
                "position {}:{} is past the end of the document ({} lines)",
                pos.line,
                pos.character,
                self.line_count()
            )
            .into());
        };
        let end = self
            .starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.text.len());
        let body = self.text[start..end]
            .strip_suffix('\n')
            .map(|b| b.strip_suffix('\r').unwrap_or(b))
            .unwrap_or(&self.text[start..end]);
        Ok(start + column_to_byte(body, pos.character))
    }
}

/// Byte offset of a zero-based UTF-16 position within `content`.
pub fn byte_offset(content: &str, pos: Position) -> Result<usize> {
    LineIndex::new(content).offset(pos)
}

/// Apply a set of non-overlapping edits. All offsets are computed against
/// the pre-edit content and the result is assembled in a single forward
/// pass, so no edit can shift another; overlapping edits are rejected.
pub fn apply_edits(content: &str, edits: &[TextEdit]) -> Result<String> {
    if edits.is_empty() {
        return Ok(content.to_string());
    }

    let index = LineIndex::new(content);
    let mut spans = Vec::with_capacity(edits.len());
    for edit in edits {
        let start = index.offset(edit.range.start)?;
        let end = index.offset(edit.range.end)?;
        if end < start {
            return Err(anyhow!(
                "edit range ends before it starts ({}:{} vs {}:{})",
                edit.range.start.line,
                edit.range.start.character,
                edit.range.end.line,
                edit.range.end.character
            )
            .into());
        }
        spans.push((start, end, edit.new_text.as_str()));
    }
    spans.sort_by_key(|(start, end, _)| (*start, *end));

    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for (start, end, replacement) in spans {
        if start < cursor {
            return Err(anyhow!("edits overlap at byte offset {start}").into());
        }
        out.push_str(&content[cursor..start]);
        out.push_str(replacement);
        cursor = end;
    }
    out.push_str(&content[cursor..]);
    Ok(out)
}

/// Walk the line counting down UTF-16 code units. A column inside a
/// surrogate pair resolves past the whole character, never mid-scalar.
fn column_to_byte(line: &str, column: u32) -> usize {
    let mut remaining = column;
    let mut bytes = 0;
    for ch in line.chars() {
        if remaining == 0 {
            break;
        }
        let units = ch.len_utf16() as u32;
        bytes += ch.len_utf8();
        remaining = remaining.saturating_sub(units);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextEdit {
        TextEdit {
            range: Range::new(Position::new(sl, sc), Position::new(el, ec)),
            new_text: text.to_string(),
        }
    }

    #[test]
    fn single_edit() {
        let out = apply_edits("hello\n", &[edit(0, 0, 0, 5, "world")]).unwrap();
        assert_eq!(out, "world\n");
    }

    #[test]
    fn utf16_edit_over_surrogate_pair() {
        // The emoji occupies two UTF-16 code units.
        let content = "a😀b\n";
        let out = apply_edits(content, &[edit(0, 1, 0, 3, "X")]).unwrap();
        assert_eq!(out, "aXb\n");
    }

    #[test]
    fn column_inside_a_surrogate_pair_resolves_past_it() {
        assert_eq!(column_to_byte("a😀b", 2), 5);
        assert_eq!(column_to_byte("a😀b", 3), 5);
        assert_eq!(column_to_byte("a😀b", 4), 6);
    }

    #[test]
    fn supply_order_does_not_affect_the_result() {
        let content = "fn one() {}\nfn two() {}\nfn three() {}\n";
        let edits = vec![
            edit(0, 3, 0, 6, "uno"),
            edit(1, 3, 1, 6, "dos"),
            edit(2, 3, 2, 8, "tres"),
        ];
        let out = apply_edits(content, &edits).unwrap();
        assert_eq!(out, "fn uno() {}\nfn dos() {}\nfn tres() {}\n");

        let mut shuffled = edits.clone();
        shuffled.reverse();
        assert_eq!(apply_edits(content, &shuffled).unwrap(), out);
    }

    #[test]
    fn overlapping_edits_are_rejected() {
        let content = "abcdef\n";
        let err = apply_edits(
            content,
            &[edit(0, 0, 0, 4, "x"), edit(0, 2, 0, 6, "y")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn insertion_at_line_boundaries() {
        let content = "abc\ndef\n";
        let out = apply_edits(content, &[edit(1, 0, 1, 0, ">> ")]).unwrap();
        assert_eq!(out, "abc\n>> def\n");
    }

    #[test]
    fn out_of_range_line_is_an_error() {
        assert!(apply_edits("abc\n", &[edit(7, 0, 7, 0, "x")]).is_err());
    }

    #[test]
    fn byte_offset_clamps_past_line_end() {
        let content = "ab\ncd\n";
        assert_eq!(byte_offset(content, Position::new(0, 99)).unwrap(), 2);
        assert_eq!(byte_offset(content, Position::new(1, 1)).unwrap(), 4);
    }

    #[test]
    fn crlf_line_endings_clamp_before_the_terminator() {
        let content = "ab\r\ncd\r\n";
        assert_eq!(byte_offset(content, Position::new(0, 99)).unwrap(), 2);
        assert_eq!(byte_offset(content, Position::new(1, 0)).unwrap(), 4);
    }

    #[test]
    fn line_index_counts_the_trailing_line() {
        let index = LineIndex::new("abc\n");
        assert_eq!(index.line_count(), 2);
        assert_eq!(index.offset(Position::new(1, 0)).unwrap(), 4);
    }
}
