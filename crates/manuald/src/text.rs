//! Text normalization and keyword matching shared by the retrieval stages,
//! the rule-based validator and feedback bookkeeping.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "if", "in", "is", "it", "its", "me", "my", "of", "on", "or", "should", "so", "that",
    "the", "this", "to", "what", "when", "where", "which", "why", "with", "you", "your",
];

/// Lowercase, strip punctuation and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content words of `text`: normalized, stopwords removed.
pub fn keywords(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

pub fn keyword_set(text: &str) -> HashSet<String> {
    keywords(text).into_iter().collect()
}

/// Jaccard similarity of two keyword sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    inter / union
}

/// Fraction of `query` keywords present in `passage`, weighted by
/// how many times they occur (capped per keyword).
pub fn keyword_score(query: &HashSet<String>, passage: &str) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let words = keywords(passage);
    let mut score = 0.0;
    for keyword in query {
        let hits = words.iter().filter(|w| *w == keyword).count();
        if hits > 0 {
            score += 1.0 + (hits.min(3) as f32 - 1.0) * 0.1;
        }
    }
    score / query.len() as f32
}

/// Bounded preview for logs.
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut)
}
