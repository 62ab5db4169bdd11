//! Shared text analysis: the same English stemming pipeline feeds the
//! keyword index, the fuzzy token scorer and the hashing embedder, so a
//! query token and a document token always normalise identically.

use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer, TokenStream,
};

/// Name under which the analyser is registered with tantivy
pub const ANALYZER_NAME: &str = "weft_en";

/// Build the stemming analyser used across the crate
pub fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(Language::English))
        .build()
}

/// Lowercased, stemmed tokens of `text` in order of appearance
pub fn tokenize(text: &str) -> Vec<String> {
    let mut analyzer = analyzer();
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    tokens
}

/// Byte offset of the first case-insensitive occurrence of `needle`
pub fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }

    for (offset, _) in haystack.char_indices() {
        let mut candidate = haystack[offset..].chars().flat_map(char::to_lowercase);
        if needle.iter().all(|c| candidate.next() == Some(*c)) {
            return Some(offset);
        }
    }
    None
}

/// Largest char boundary in `text` that is `<= index`
pub fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Number of chars in `text`
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Prefix of `text` holding at most `max_chars` chars
pub fn take_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}
