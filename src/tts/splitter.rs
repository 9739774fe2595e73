//! Narration text segmentation
//!
//! Breaks a landmark description into short spans that are synthesized
//! independently. Each segment is one sentence, or two when the first is a
//! short fragment such as an abbreviation, so the first audio arrives
//! quickly and every request stays well under the voice service's payload
//! limits.

use regex::Regex;
use std::sync::OnceLock;

/// Hard character budget for one segment.
pub const MAX_SEGMENT_CHARS: usize = 300;

/// A segment shorter than this takes the following sentence along.
pub const MIN_SEGMENT_CHARS: usize = 12;

/// Sentences merged into one segment at most.
pub const MAX_SENTENCES_PER_SEGMENT: usize = 2;

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CJK full stops end a sentence without trailing whitespace.
        Regex::new(r#"[.!?…]+["'”’»)\]]*(?:\s+|$)|[。！？]+["'”’»)\]]*\s*"#)
            .expect("valid sentence regex")
    })
}

fn clause_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[,;:—–]\s+").expect("valid clause regex"))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split narration into ordered segments of one sentence each, joining
/// fragments shorter than [`MIN_SEGMENT_CHARS`] to the next sentence.
///
/// Joining the result with single spaces gives back the input modulo
/// whitespace. Empty or whitespace-only input yields no segments.
pub fn split_into_segments(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut sentences_in_current = 0;

    for sentence in split_sentences(text) {
        if char_len(sentence) > MAX_SEGMENT_CHARS {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
                sentences_in_current = 0;
            }
            segments.extend(split_long_sentence(sentence));
            continue;
        }

        let would_overflow = char_len(&current) + 1 + char_len(sentence) > MAX_SEGMENT_CHARS;
        if !current.is_empty()
            && (sentences_in_current >= MAX_SENTENCES_PER_SEGMENT
                || char_len(&current) >= MIN_SEGMENT_CHARS
                || would_overflow)
        {
            segments.push(std::mem::take(&mut current));
            sentences_in_current = 0;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
        sentences_in_current += 1;
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

/// Sentence spans of `text`, trimmed, in order.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for m in sentence_end().find_iter(text) {
        let sentence = text[start..m.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = m.end();
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }

    sentences
}

/// Wrap a sentence that exceeds the budget, at clause punctuation first and
/// at word boundaries when a clause alone is still too long.
fn split_long_sentence(sentence: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut start = 0;
    for m in clause_end().find_iter(sentence) {
        clauses.push(sentence[start..m.end()].trim());
        start = m.end();
    }
    clauses.push(sentence[start..].trim());

    let mut pieces = Vec::new();
    let mut current = String::new();

    for clause in clauses.into_iter().filter(|c| !c.is_empty()) {
        let units: Vec<String> = if char_len(clause) > MAX_SEGMENT_CHARS {
            wrap_words(clause)
        } else {
            vec![clause.to_string()]
        };

        for unit in units {
            if !current.is_empty() && char_len(&current) + 1 + char_len(&unit) > MAX_SEGMENT_CHARS {
                pieces.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&unit);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn wrap_words(clause: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in clause.split_whitespace() {
        if char_len(word) > MAX_SEGMENT_CHARS {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            // No whitespace to break on, cut at character boundaries.
            let chars: Vec<char> = word.chars().collect();
            lines.extend(
                chars
                    .chunks(MAX_SEGMENT_CHARS)
                    .map(|c| c.iter().collect::<String>()),
            );
            continue;
        }
        if !current.is_empty() && char_len(&current) + 1 + char_len(word) > MAX_SEGMENT_CHARS {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<&str> {
        text.split_whitespace().collect()
    }

    #[test]
    fn empty_and_blank_text_yield_nothing() {
        assert!(split_into_segments("").is_empty());
        assert!(split_into_segments("   \n\t ").is_empty());
    }

    #[test]
    fn one_segment_per_sentence() {
        let segments = split_into_segments("Sentence one. Sentence two. Sentence three.");
        assert_eq!(segments, vec!["Sentence one.", "Sentence two.", "Sentence three."]);
    }

    #[test]
    fn short_fragment_joins_next_sentence() {
        let segments = split_into_segments("St. Paul's Cathedral is tall. It has a dome. Wow. Nice.");
        assert_eq!(
            segments,
            vec!["St. Paul's Cathedral is tall.", "It has a dome.", "Wow. Nice."]
        );
    }

    #[test]
    fn text_without_terminal_punctuation_is_kept() {
        let segments = split_into_segments("Built in 1889 by Gustave Eiffel");
        assert_eq!(segments, vec!["Built in 1889 by Gustave Eiffel"]);
    }

    #[test]
    fn reconstructs_words_in_order() {
        let text = "The Colosseum was completed in 80 AD!  It held up to 80,000 spectators?\n\
                    Gladiators fought here. Later it became a quarry… Today it is a symbol of Rome. \
                    \"Quite something,\" said the guide.";
        let segments = split_into_segments(text);
        assert!(segments.len() >= 3);
        assert_eq!(words(&segments.join(" ")), words(text));
    }

    #[test]
    fn long_sentence_is_wrapped_under_budget() {
        let clause = "the cathedral nave stretches toward the altar";
        let sentence = std::iter::repeat(clause).take(20).collect::<Vec<_>>().join(", ") + ".";
        let segments = split_into_segments(&sentence);

        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| char_len(s) <= MAX_SEGMENT_CHARS));
        assert_eq!(words(&segments.join(" ")), words(&sentence));
    }

    #[test]
    fn unbroken_run_is_cut_at_char_boundaries() {
        let word = "é".repeat(MAX_SEGMENT_CHARS + 10);
        let segments = split_into_segments(&word);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments.concat(), word);
    }

    #[test]
    fn cjk_full_stops_end_sentences() {
        let segments = split_into_segments("这是长城。它很长。非常古老。");
        assert_eq!(segments, vec!["这是长城。 它很长。", "非常古老。"]);
    }
}
