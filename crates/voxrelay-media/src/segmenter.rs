//! Groups streamed reasoning tokens into speakable units.
//!
//! A unit ends at sentence punctuation followed by whitespace, at clause
//! punctuation once enough text is pending, or at the last whitespace before
//! `max_unit_chars` when no punctuation turns up.

use voxrelay_core::config::SegmenterConfig;

#[derive(Debug)]
pub struct Segmenter {
    pending: String,
    min_clause_chars: usize,
    max_unit_chars: usize,
}

impl Segmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            pending: String::new(),
            min_clause_chars: config.min_clause_chars,
            max_unit_chars: config.max_unit_chars.max(1),
        }
    }

    /// Append a token and return every unit it completes.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        if self.pending.is_empty() {
            self.pending.push_str(token.trim_start());
        } else {
            self.pending.push_str(token);
        }

        let mut ready = Vec::new();
        while let Some(end) = self.next_boundary() {
            let rest = self.pending.split_off(end);
            let unit = std::mem::replace(&mut self.pending, rest.trim_start().to_string());
            let unit = unit.trim();
            if !unit.is_empty() {
                ready.push(unit.to_string());
            }
        }
        ready
    }

    /// Flush whatever is pending at end of turn.
    pub fn finish(&mut self) -> Option<String> {
        let unit = std::mem::take(&mut self.pending);
        let unit = unit.trim();
        (!unit.is_empty()).then(|| unit.to_string())
    }

    /// Drop pending text, e.g. when the turn is cancelled.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Byte offset at which the next unit ends, if one is complete.
    fn next_boundary(&self) -> Option<usize> {
        let text = self.pending.as_str();
        let mut chars = text.char_indices().peekable();
        let mut count = 0usize;

        while let Some((idx, ch)) = chars.next() {
            count += 1;
            let end = idx + ch.len_utf8();
            let next = chars.peek().map(|&(_, c)| c);

            if is_terminal_boundary(ch) {
                return Some(end);
            }
            if is_sentence_boundary(ch) && next.is_some_and(char::is_whitespace) {
                return Some(end);
            }
            if is_clause_boundary(ch)
                && count >= self.min_clause_chars
                && next.is_some_and(char::is_whitespace)
            {
                return Some(end);
            }
            if count >= self.max_unit_chars && next.is_some() {
                return Some(
                    text[..end]
                        .rfind(char::is_whitespace)
                        .filter(|&ws| ws > 0)
                        .unwrap_or(end),
                );
            }
        }
        None
    }
}

/// Ends a sentence only when followed by whitespace, so "3.5" stays whole.
fn is_sentence_boundary(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '…')
}

/// Ends a unit on its own.
fn is_terminal_boundary(ch: char) -> bool {
    matches!(ch, '\n' | '。' | '！' | '？' | '；')
}

fn is_clause_boundary(ch: char) -> bool {
    matches!(ch, ',' | ';' | ':' | '，' | '、')
}
