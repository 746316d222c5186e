//! Source deduplication and prompt-ready formatting of sources and notes.
//!
//! Everything here is pure and byte-stable: the same input always renders to
//! the same string.

use std::collections::HashSet;

use crate::search::SearchHit;

/// Flatten per-query hit lists and drop later hits whose URL was already
/// seen. Survivors keep their first-seen order.
pub fn dedupe_sources<I>(batches: I) -> Vec<SearchHit>
where
    I: IntoIterator<Item = Vec<SearchHit>>,
{
    let mut seen = HashSet::new();
    batches
        .into_iter()
        .flatten()
        .filter(|hit| seen.insert(hit.url.clone()))
        .collect()
}

/// Render the notes block fed to the extraction prompt.
pub fn format_notes(notes: &[String]) -> String {
    let rule = "=".repeat(60);
    let mut out = String::new();
    for (idx, note) in notes.iter().enumerate() {
        out.push_str(&format!(
            "\n{rule}\nNote: {}:\n{rule}\nNotes from research:\n{}",
            idx + 1,
            note
        ));
    }
    out
}

/// Render the sources block fed to the note synthesis prompt.
///
/// Raw page content is cut to roughly `max_tokens_per_source` tokens at four
/// characters per token.
pub fn format_sources(
    sources: &[SearchHit],
    include_raw_content: bool,
    max_tokens_per_source: usize,
) -> String {
    let mut out = String::from("Sources:\n\n");
    let char_limit = max_tokens_per_source.saturating_mul(4);

    for source in sources {
        out.push_str(&format!("Source {}:\n===\n", source.title));
        out.push_str(&format!("URL: {}\n===\n", source.url));
        out.push_str(&format!(
            "Most relevant content from source: {}\n===\n",
            source.content
        ));
        if include_raw_content {
            let raw = source.raw_content.as_deref().unwrap_or_default();
            let raw = if raw.chars().count() > char_limit {
                let cut: String = raw.chars().take(char_limit).collect();
                format!("{}...[truncated]", cut)
            } else {
                raw.to_string()
            };
            out.push_str(&format!(
                "Full source content limited to {} tokens: {}\n\n",
                max_tokens_per_source, raw
            ));
        }
    }

    out.trim().to_string()
}
