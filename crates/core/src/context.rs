//! Context assembly under a character budget.

use crate::models::{Citation, RetrievedContext, SearchHit};

pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";
const EXCERPT_CHARS: usize = 200;

/// A ranked hit paired with the display name of its document.
#[derive(Debug, Clone)]
pub struct ContextCandidate {
    pub hit: SearchHit,
    pub document_name: String,
}

/// Greedily joins candidates in rank order while the assembled context,
/// separators included, stays within `max_chars`. Stops at the first
/// candidate that would overflow.
pub fn assemble_context(candidates: Vec<ContextCandidate>, max_chars: usize) -> RetrievedContext {
    let separator_len = CONTEXT_SEPARATOR.chars().count();
    let mut parts = Vec::new();
    let mut citations = Vec::new();
    let mut used = 0usize;

    for candidate in candidates {
        let part = format!(
            "[Source: {}]\n{}",
            candidate.document_name, candidate.hit.text
        );
        let mut cost = part.chars().count();
        if !parts.is_empty() {
            cost += separator_len;
        }
        if used + cost > max_chars {
            break;
        }

        used += cost;
        parts.push(part);
        citations.push(citation(candidate));
    }

    RetrievedContext {
        context: parts.join(CONTEXT_SEPARATOR),
        citations,
    }
}

fn citation(candidate: ContextCandidate) -> Citation {
    let ContextCandidate { hit, document_name } = candidate;
    Citation {
        excerpt: excerpt(&hit.text),
        document_id: hit.document_id,
        document_name,
        record_id: hit.record_id,
        page_number: hit.page_number,
        relevance_score: hit.score,
    }
}

/// First 200 characters, with `...` appended when the text is longer.
pub fn excerpt(text: &str) -> String {
    truncate_with_ellipsis(text, EXCERPT_CHARS)
}

pub(crate) fn truncate_with_ellipsis(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn candidate(id: &str, name: &str, text: &str, score: f64) -> ContextCandidate {
        ContextCandidate {
            hit: SearchHit {
                record_id: format!("{id}_0"),
                document_id: id.to_string(),
                text: text.to_string(),
                score,
                metadata: Metadata::new(),
                page_number: Some(2),
            },
            document_name: name.to_string(),
        }
    }

    #[test]
    fn parts_are_prefixed_and_separated() {
        let context = assemble_context(
            vec![
                candidate("a", "Manual", "first", 0.9),
                candidate("b", "Sheet", "second", 0.8),
            ],
            1_000,
        );

        assert_eq!(
            context.context,
            "[Source: Manual]\nfirst\n\n---\n\n[Source: Sheet]\nsecond"
        );
        assert_eq!(context.citations.len(), 2);
        assert_eq!(context.citations[0].document_name, "Manual");
        assert_eq!(context.citations[1].record_id, "b_0");
        assert_eq!(context.citations[1].page_number, Some(2));
    }

    #[test]
    fn budget_stops_at_first_overflow() {
        let candidates = vec![
            candidate("a", "A", &"x".repeat(40), 0.9),
            candidate("b", "B", &"y".repeat(400), 0.8),
            candidate("c", "C", "z", 0.7),
        ];

        let context = assemble_context(candidates, 100);
        assert_eq!(context.citations.len(), 1);
        assert_eq!(context.citations[0].document_id, "a");
        assert!(!context.context.contains('z'));
        assert!(context.context.chars().count() <= 100);
    }

    #[test]
    fn budget_counts_the_separator() {
        let first = "[Source: A]\naaaa";
        let second = "[Source: B]\nbbbb";
        let exact = first.len() + CONTEXT_SEPARATOR.len() + second.len();
        let candidates = || {
            vec![
                candidate("a", "A", "aaaa", 0.9),
                candidate("b", "B", "bbbb", 0.8),
            ]
        };

        assert_eq!(assemble_context(candidates(), exact).citations.len(), 2);
        assert_eq!(assemble_context(candidates(), exact - 1).citations.len(), 1);
    }

    #[test]
    fn empty_input_gives_empty_context() {
        let context = assemble_context(Vec::new(), 3_000);
        assert!(context.is_empty());
        assert_eq!(context.context, "");
    }

    #[test]
    fn excerpt_truncates_long_text() {
        let long = "é".repeat(250);
        let short = excerpt(&long);
        assert_eq!(short.chars().count(), 203);
        assert!(short.ends_with("..."));

        assert_eq!(excerpt(&"a".repeat(200)), "a".repeat(200));
        assert_eq!(excerpt("short"), "short");
    }
}
