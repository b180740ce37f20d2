//! Deterministic topic identity.
//!
//! The slug is the primary deduplication key: every raw topic string that
//! normalizes to the same slug resolves to the same topic. Embedding
//! similarity is only consulted when the slug misses.

/// English stop words stripped from slugs. Removal is skipped when it
/// would leave fewer than three tokens, so short titles keep their shape.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "how", "in", "into",
    "is", "it", "of", "on", "or", "that", "the", "their", "this", "to", "what", "when", "where",
    "which", "who", "why", "with",
];

const MAX_SLUG_LEN: usize = 80;

/// Collapse internal whitespace and trim, producing the display title.
pub fn normalize_title(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derive the canonical slug for a topic title.
///
/// Lowercases, folds common diacritics to ASCII, strips punctuation,
/// removes stop words when at least three tokens survive the removal,
/// hyphenates, and truncates at a word boundary within 80 characters.
pub fn slugify(title: &str) -> String {
    let mut normalized = String::with_capacity(title.len());
    for c in title.chars() {
        for folded in fold_char(c) {
            normalized.push(folded);
        }
    }

    let tokens: Vec<&str> = normalized
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let filtered: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !STOP_WORDS.contains(t))
        .collect();

    // Stop-word removal only when it leaves a meaningful slug
    let kept = if filtered.len() >= 3 { filtered } else { tokens };

    let slug = kept.join("-");
    truncate_at_word_boundary(&slug, MAX_SLUG_LEN)
}

/// Lowercase and fold a character to its ASCII equivalent(s).
/// Characters with no mapping become spaces (token separators).
fn fold_char(c: char) -> Vec<char> {
    let lower = c.to_lowercase().next().unwrap_or(c);
    if lower.is_ascii_alphanumeric() {
        return vec![lower];
    }
    match lower {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => vec!['a'],
        'è' | 'é' | 'ê' | 'ë' => vec!['e'],
        'ì' | 'í' | 'î' | 'ï' => vec!['i'],
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => vec!['o'],
        'ù' | 'ú' | 'û' | 'ü' => vec!['u'],
        'ý' | 'ÿ' => vec!['y'],
        'ç' => vec!['c'],
        'ñ' => vec!['n'],
        'ß' => vec!['s', 's'],
        'æ' => vec!['a', 'e'],
        'œ' => vec!['o', 'e'],
        _ => vec![' '],
    }
}

/// Cut a hyphenated slug to at most `max_len` characters without splitting
/// a word. A single over-long token is hard-cut.
fn truncate_at_word_boundary(slug: &str, max_len: usize) -> String {
    if slug.len() <= max_len {
        return slug.to_string();
    }
    match slug[..max_len].rfind('-') {
        Some(idx) => slug[..idx].to_string(),
        None => slug[..max_len].to_string(),
    }
}
