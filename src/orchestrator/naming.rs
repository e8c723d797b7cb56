//! Artifact and ledger file names.

use crate::planner::Chunk;

const MAX_STEM_CHARS: usize = 80;
const FALLBACK_STEM: &str = "document";

/// Reduces a display name to a portable file stem.
pub(crate) fn sanitize_stem(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed: String = out
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed
    }
}

/// `<stem>.pdf` for a single-chunk plan, else `<stem>_partNN_pFIRST-LAST.pdf`
/// with 1-based page numbers.
pub(crate) fn artifact_file_name(stem: &str, chunk: &Chunk, ordinal: usize, total: usize) -> String {
    if total <= 1 {
        return format!("{stem}.pdf");
    }
    let width = total.to_string().len().max(2);
    format!(
        "{stem}_part{ordinal:0width$}_p{first}-{last}.pdf",
        ordinal = ordinal + 1,
        first = chunk.start + 1,
        last = chunk.end,
    )
}

pub(crate) fn ledger_file_name(manifest_id: &str) -> String {
    format!(".{}.chunks.json", sanitize_stem(manifest_id))
}
