//! Deterministic overlapping text chunker.
//!
//! Splits one message's text into model-sized segments on exact token
//! boundaries. Near-threshold text is kept whole rather than split
//! gratuitously; longer text is cut into evenly sized strides, each extended
//! by the overlap in both directions so adjacent chunks share boundary
//! context. A short trailing fragment is merged into the penultimate
//! segment.
//!
//! Any tokenize or decode failure degrades to the whole untouched text as a
//! single segment — chunking never drops content.

use tracing::warn;

use crate::tokenizer::Tokenizer;

/// Split `text` into overlapping segments of roughly `target` tokens.
///
/// The segment count is `round(n / target)`; the whole text is emitted as
/// one chunk whenever that is at least as close to the target as the even
/// split would be.
pub fn split(tokenizer: &Tokenizer, text: &str, target: usize, overlap: usize) -> Vec<String> {
    let tokens = tokenizer.tokenize(text);
    let n = tokens.len();

    let segment_count = std::cmp::max(1, (n as f64 / target as f64).round() as usize);

    // Keep near-threshold text whole: compare how far one chunk vs. the
    // even split lands from the target length.
    let whole_distance = (n as f64 - target as f64).abs();
    let split_distance = (n as f64 / segment_count as f64 - target as f64).abs();
    if whole_distance <= split_distance {
        return vec![text.to_string()];
    }

    let optimal = n / segment_count;
    if optimal == 0 {
        return vec![text.to_string()];
    }

    let mut segments: Vec<Vec<u32>> = Vec::new();
    let mut i = 0;
    while i < n {
        let start = i.saturating_sub(overlap);
        let end = std::cmp::min(i + optimal + overlap, n);
        segments.push(tokens[start..end].to_vec());
        i += optimal;
    }

    // A short trailing fragment carries too little context on its own.
    if segments.len() > 1 && segments.last().map(Vec::len).unwrap_or(0) < optimal {
        let tail = segments.pop().unwrap_or_default();
        if let Some(prev) = segments.last_mut() {
            prev.extend(tail);
        }
    }

    let mut chunks = Vec::with_capacity(segments.len());
    for segment in segments {
        match tokenizer.stringify(segment) {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => {
                warn!(error = %e, "chunk decode failed, keeping message whole");
                return vec![text.to_string()];
            }
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new().unwrap()
    }

    /// Repeats a single-token word so token counts track word counts.
    fn words(n: usize) -> String {
        vec!["hello"; n].join(" ")
    }

    #[test]
    fn test_short_text_single_chunk() {
        let tok = tokenizer();
        let chunks = split(&tok, "Just a short note.", 1024, 128);
        assert_eq!(chunks, vec!["Just a short note.".to_string()]);
    }

    #[test]
    fn test_near_threshold_text_stays_whole() {
        // ~512 tokens against a 1024 target: one chunk equal to the input.
        let tok = tokenizer();
        let text = words(512);
        let n = tok.count_text(&text);
        assert!(n < 1024, "setup: {n} tokens");

        let chunks = split(&tok, &text, 1024, 128);
        assert_eq!(chunks, vec![text]);
    }

    #[test]
    fn test_double_length_text_splits_with_overlap() {
        // ~2050 tokens against a 1024 target: two chunks sharing a boundary
        // window of at least the overlap length.
        let tok = tokenizer();
        let text = words(2050);
        let n = tok.count_text(&text);
        assert!((1537..2560).contains(&n), "setup: {n} tokens");

        let chunks = split(&tok, &text, 1024, 128);
        assert_eq!(chunks.len(), 2);
        assert!(text.starts_with(&chunks[0]));
        assert!(text.ends_with(&chunks[1]));

        // Each chunk is a contiguous token range, so both decode to exact
        // substrings; the windows overlap around the stride boundary.
        let overlap_len = (1..=chunks[1].len())
            .rev()
            .find(|k| chunks[1].is_char_boundary(*k) && chunks[0].ends_with(&chunks[1][..*k]))
            .unwrap_or(0);
        assert!(
            overlap_len >= 128,
            "shared window too small: {overlap_len} bytes"
        );
    }

    #[test]
    fn test_no_word_is_lost_across_boundaries() {
        // Distinct words; the 128-token overlap dwarfs any single word, so
        // every source word must survive intact in at least one chunk.
        let tok = tokenizer();
        let source_words: Vec<String> = (0..1200).map(|i| format!("item{i}")).collect();
        let text = source_words.join(" ");
        let chunks = split(&tok, &text, 1024, 128);
        assert!(chunks.len() >= 2, "setup: expected a multi-chunk split");

        let seen: std::collections::HashSet<&str> = chunks
            .iter()
            .flat_map(|c| c.split_whitespace())
            .collect();
        for word in &source_words {
            assert!(seen.contains(word.as_str()), "lost word: {word}");
        }

        assert!(text.starts_with(&chunks[0]));
        assert!(chunks.last().unwrap().ends_with(source_words.last().unwrap()));
    }

    #[test]
    fn test_trailing_fragment_merges_into_penultimate() {
        // ~3200 tokens, 1024 target: three even strides plus a short tail
        // that merges backward instead of surviving as a fragment.
        let tok = tokenizer();
        let text = words(3200);
        let n = tok.count_text(&text);
        assert!((2560..3584).contains(&n), "setup: {n} tokens");

        let chunks = split(&tok, &text, 1024, 128);
        assert_eq!(chunks.len(), 3);
        // The tail was folded into the final chunk instead of surviving as
        // a fragment: every chunk is at least a full stride long.
        for chunk in &chunks {
            assert!(tok.count_text(chunk) > 1000, "fragment survived the merge");
        }
    }

    #[test]
    fn test_empty_text_stays_whole() {
        let tok = tokenizer();
        let chunks = split(&tok, "", 1024, 128);
        assert_eq!(chunks, vec![String::new()]);
    }

    #[test]
    fn test_deterministic() {
        let tok = tokenizer();
        let text = words(2050);
        assert_eq!(split(&tok, &text, 1024, 128), split(&tok, &text, 1024, 128));
    }

    #[test]
    fn test_zero_overlap_still_covers() {
        let tok = tokenizer();
        let text = words(2050);
        let chunks = split(&tok, &text, 1024, 0);
        assert_eq!(chunks.len(), 2);
        // Adjacent token ranges decode to adjacent byte ranges.
        assert_eq!(chunks.concat(), text);
    }
}
