//! Incremental sentence splitting over the token stream.
//!
//! Deltas are appended to an accumulator; a sentence boundary is a run of
//! `.?!` followed by whitespace, or a newline. Two guards keep the cuts
//! speakable: common abbreviations never end a sentence, and sentences
//! shorter than the minimum keep accumulating. Whatever remains at
//! end-of-stream is flushed as a final sentence regardless of length.

/// Abbreviations that end with a period but not a sentence.
const ABBREVIATIONS: &[&str] = &["Mr.", "Mrs.", "Dr.", "St.", "e.g.", "i.e."];

/// Minimum sentence length (chars, trimmed) except for the final flush.
const MIN_SENTENCE_CHARS: usize = 8;

/// Accumulates text deltas and emits complete sentences as early as possible.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta, returning every sentence completed by it.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut sentences = Vec::new();
        while let Some(end) = self.find_boundary() {
            let sentence: String = self.buffer.drain(..end).collect();
            let trimmed = sentence.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
        }
        sentences
    }

    /// Flush any residual text at end-of-stream.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Byte offset just past the next valid sentence boundary, if any.
    fn find_boundary(&self) -> Option<usize> {
        let bytes = self.buffer.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];

            if b == b'\n' {
                if self.is_valid_cut(i) {
                    return Some(i + 1);
                }
                i += 1;
                continue;
            }

            if matches!(b, b'.' | b'?' | b'!') {
                // extend over the whole punctuation run
                let mut end = i + 1;
                while end < bytes.len() && matches!(bytes[end], b'.' | b'?' | b'!') {
                    end += 1;
                }
                // more punctuation may still arrive for a run at the tail
                if end == bytes.len() {
                    return None;
                }
                if bytes[end].is_ascii_whitespace()
                    && self.is_valid_cut(end)
                    && !self.ends_with_abbreviation(end)
                {
                    return Some(end);
                }
                i = end;
                continue;
            }

            i += 1;
        }
        None
    }

    /// Length guard for a candidate sentence ending at `end`.
    fn is_valid_cut(&self, end: usize) -> bool {
        self.buffer[..end].trim().chars().count() >= MIN_SENTENCE_CHARS
    }

    /// Whether the candidate's last word is a known abbreviation.
    fn ends_with_abbreviation(&self, end: usize) -> bool {
        let candidate = self.buffer[..end].trim_end();
        match candidate.rsplit(char::is_whitespace).next() {
            Some(word) => ABBREVIATIONS
                .iter()
                .any(|abbr| word.eq_ignore_ascii_case(abbr)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(text: &str, chunk: usize) -> Vec<String> {
        let mut splitter = SentenceSplitter::new();
        let chars: Vec<char> = text.chars().collect();
        let mut sentences = Vec::new();
        for piece in chars.chunks(chunk) {
            let delta: String = piece.iter().collect();
            sentences.extend(splitter.push(&delta));
        }
        sentences.extend(splitter.flush());
        sentences
    }

    #[test]
    fn test_basic_sentences() {
        let sentences = split_all("Hello there, world. How are you today? I am fine!", 5);
        assert_eq!(
            sentences,
            vec![
                "Hello there, world.",
                "How are you today?",
                "I am fine!"
            ]
        );
    }

    #[test]
    fn test_splits_do_not_depend_on_chunking() {
        for chunk in [1, 2, 3, 7, 50] {
            let sentences = split_all("One two three four. Five six seven eight.", chunk);
            assert_eq!(sentences.len(), 2, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let sentences = split_all("I saw Dr. Smith at the clinic. He waved.", 4);
        assert_eq!(sentences[0], "I saw Dr. Smith at the clinic.");
        assert_eq!(sentences[1], "He waved.");

        let sentences = split_all("Use a cache, e.g. an in-memory map. It is faster.", 6);
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("e.g. an in-memory map"));
    }

    #[test]
    fn test_short_fragment_keeps_accumulating() {
        let mut splitter = SentenceSplitter::new();
        // "Yes. " is under the minimum and must not split on its own
        assert!(splitter.push("Yes. ").is_empty());
        let sentences = splitter.push("I think that is right. ");
        assert_eq!(sentences, vec!["Yes. I think that is right."]);
    }

    #[test]
    fn test_newline_is_a_boundary() {
        let sentences = split_all("First line of reply\nSecond line here", 9);
        assert_eq!(sentences, vec!["First line of reply", "Second line here"]);
    }

    #[test]
    fn test_punctuation_run_stays_together() {
        let sentences = split_all("Are you serious?! That is wild. ", 4);
        assert_eq!(sentences, vec!["Are you serious?!", "That is wild."]);
    }

    #[test]
    fn test_final_flush_ignores_minimum() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Okay").is_empty());
        assert_eq!(splitter.flush().as_deref(), Some("Okay"));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn test_trailing_punctuation_waits_for_more_input() {
        let mut splitter = SentenceSplitter::new();
        // the run may still grow ("?!"), so no emit until whitespace follows
        assert!(splitter.push("Is that everything you need?").is_empty());
        let sentences = splitter.push(" Yes, it certainly is.");
        assert_eq!(sentences, vec!["Is that everything you need?"]);
        assert_eq!(splitter.flush().as_deref(), Some("Yes, it certainly is."));
    }
}
