//! Streaming stop-sequence detection.
//!
//! Generated text arrives in arbitrary chunks, so a stop sequence can span
//! chunk boundaries. [`AntipromptFinder`] keeps a cursor into its needle
//! between feeds; [`AntipromptManager`] runs several finders and reports the
//! first completion.

/// Incremental single-needle matcher.
#[derive(Debug, Clone)]
pub struct AntipromptFinder {
    needle: String,
    cursor: usize,
}

impl AntipromptFinder {
    pub fn new(needle: impl Into<String>) -> Self {
        AntipromptFinder {
            needle: needle.into(),
            cursor: 0,
        }
    }

    pub fn needle(&self) -> &str {
        &self.needle
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Consume a chunk. Returns `-1` if the needle did not complete in this
    /// chunk, otherwise the byte position one past the needle's final byte
    /// (so `chunk[k..]` is the post-match tail). Matching is case-sensitive;
    /// on mismatch the cursor restarts and the current byte is retried
    /// against the needle's first byte. Completion resets the cursor.
    pub fn feed(&mut self, chunk: &str) -> i32 {
        if self.needle.is_empty() {
            return -1;
        }

        let needle = self.needle.as_bytes();
        let text = chunk.as_bytes();
        let mut pos = 0usize;

        while pos < text.len() && self.cursor < needle.len() {
            if needle[self.cursor] != text[pos] {
                self.cursor = 0;
            }
            if needle[self.cursor] == text[pos] {
                self.cursor += 1;
            }
            pos += 1;
        }

        if self.cursor == needle.len() {
            self.cursor = 0;
            return pos as i32;
        }

        -1
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Runs registered finders in order over generated text.
#[derive(Debug, Default)]
pub struct AntipromptManager {
    finders: Vec<AntipromptFinder>,
}

impl AntipromptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_antiprompt(&mut self, antiprompt: impl Into<String>) {
        self.finders.push(AntipromptFinder::new(antiprompt));
    }

    /// Feed a chunk of generated text to every finder in registration
    /// order. On the first completion, returns the needle concatenated with
    /// the post-match tail of *this* chunk and resets all finders.
    /// Returns an empty string while nothing has completed.
    pub fn feed_generated_text(&mut self, text: &str) -> String {
        for i in 0..self.finders.len() {
            let found = self.finders[i].feed(text);
            if found > 0 {
                let needle = self.finders[i].needle().to_string();
                self.reset();
                return needle + &text[found as usize..];
            }
        }
        String::new()
    }

    /// Whether any finder is mid-match (useful to delay emission of text
    /// that may turn out to be a stop sequence).
    pub fn has_running_antiprompts(&self) -> bool {
        self.finders.iter().any(|f| f.cursor() > 0)
    }

    pub fn reset(&mut self) {
        for f in &mut self.finders {
            f.reset();
        }
    }

    pub fn clear(&mut self) {
        self.finders.clear();
    }
}
