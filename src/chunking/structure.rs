//! Structural metadata: Markdown detection and validation

use super::models::{Document, StructuralKind, StructuralUnit, TextRange};
use crate::error::{ContextError, Result};

/// Detect protected units in Markdown text: table rows, fenced code blocks, headings.
///
/// Ranges exclude the trailing newline of the last line in the unit.
pub fn detect_markdown_structure(text: &str) -> Vec<StructuralUnit> {
    let mut units = Vec::new();
    let mut fence_start: Option<usize> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        let line_end = line_start + content.len();
        let trimmed = content.trim_start();

        if trimmed.starts_with("```") {
            match fence_start.take() {
                Some(start) => units.push(StructuralUnit::new(
                    StructuralKind::CodeBlock,
                    TextRange::new(start, line_end),
                )),
                None => fence_start = Some(line_start),
            }
            continue;
        }

        if fence_start.is_some() {
            continue;
        }

        if trimmed.starts_with('|') {
            units.push(StructuralUnit::new(
                StructuralKind::TableRow,
                TextRange::new(line_start, line_end),
            ));
        } else if is_heading(trimmed) {
            units.push(StructuralUnit::new(
                StructuralKind::Heading,
                TextRange::new(line_start, line_end),
            ));
        }
    }

    // unterminated fence runs to the end of the text
    if let Some(start) = fence_start {
        units.push(StructuralUnit::new(
            StructuralKind::CodeBlock,
            TextRange::new(start, text.len()),
        ));
    }

    units
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

/// Reject metadata ranges that are out of bounds or split a UTF-8 character
pub fn validate_document(doc: &Document) -> Result<()> {
    let text = &doc.text;
    let check = |range: &TextRange, what: &str| -> Result<()> {
        if range.start > range.end
            || range.end > text.len()
            || !text.is_char_boundary(range.start)
            || !text.is_char_boundary(range.end)
        {
            return Err(ContextError::Ingestion {
                doc_id: doc.id.clone(),
                reason: format!(
                    "{} range {}..{} is invalid for text of {} bytes",
                    what,
                    range.start,
                    range.end,
                    text.len()
                ),
            });
        }
        Ok(())
    };

    for unit in &doc.metadata.structure {
        check(&unit.range, "structural unit")?;
    }

    let mut spans: Vec<&TextRange> = doc
        .metadata
        .provenance_spans
        .iter()
        .map(|s| &s.range)
        .collect();
    for span in &spans {
        check(span, "provenance span")?;
    }
    spans.sort();
    for pair in spans.windows(2) {
        if pair[0].overlaps(pair[1]) {
            return Err(ContextError::Ingestion {
                doc_id: doc.id.clone(),
                reason: format!(
                    "provenance spans {}..{} and {}..{} overlap",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                ),
            });
        }
    }

    Ok(())
}
