//! Sentence assembly for the synthesis-ready text stream.
//!
//! The splitter accumulates token fragments and emits whole sentences once a
//! terminator is seen and the buffered prefix is long enough to make a decent
//! TTS utterance. One instance serves exactly one agent text stream and is
//! discarded when the stream ends.

/// Default minimum emitted chunk length, in Unicode code points.
pub const DEFAULT_MIN_CHUNK_LEN: usize = 10;

/// Sentence terminators, applied uniformly across scripts.
const TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];

const REASONING_START: &str = "<think>";
const REASONING_END: &str = "</think>";

/// Stateful splitter that turns arbitrary text fragments into sentence-sized
/// chunks.
///
/// Scanning uses the *last* terminator in the buffer so multi-sentence
/// fragments collapse into a single emission, while fragments shorter than
/// `min_chunk_len` merge forward until enough text has accumulated. Reasoning
/// spans delimited by `<think>`/`</think>` are dropped before buffering.
pub struct ChunkSplitter {
    buffer: String,
    min_chunk_len: usize,
    inside_reasoning: bool,
}

impl ChunkSplitter {
    pub fn new(min_chunk_len: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chunk_len: min_chunk_len.max(1),
            inside_reasoning: false,
        }
    }

    /// Append a fragment and return zero or more completed sentences.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        if fragment.is_empty() {
            return Vec::new();
        }

        let visible = self.filter_reasoning(fragment);
        if visible.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(&visible);

        let Some(pos) = self.buffer.rfind(TERMINATORS) else {
            return Vec::new();
        };
        let end = pos
            + self.buffer[pos..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);

        if self.buffer[..end].chars().count() < self.min_chunk_len {
            return Vec::new();
        }

        let sentence = self.buffer[..end].trim().to_string();
        self.buffer.drain(..end);
        if sentence.is_empty() {
            Vec::new()
        } else {
            vec![sentence]
        }
    }

    /// Return any non-empty residual buffer as a final chunk and clear state.
    pub fn finalize(&mut self) -> Vec<String> {
        let remainder = std::mem::take(&mut self.buffer);
        self.inside_reasoning = false;
        let remainder = remainder.trim();
        if remainder.is_empty() {
            Vec::new()
        } else {
            vec![remainder.to_string()]
        }
    }

    /// Number of buffered (not yet emitted) bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Strip `<think>…</think>` spans, tracking open spans across fragments.
    fn filter_reasoning(&mut self, fragment: &str) -> String {
        // ASCII-lowercasing preserves byte offsets, so indices found in the
        // lowered copy are valid in the original fragment.
        let lower = fragment.to_ascii_lowercase();
        if !self.inside_reasoning && !lower.contains(REASONING_START) {
            return fragment.to_string();
        }

        let mut out = String::with_capacity(fragment.len());
        let mut idx = 0;
        while idx < fragment.len() {
            let tag = if self.inside_reasoning {
                REASONING_END
            } else {
                REASONING_START
            };
            match lower[idx..].find(tag) {
                Some(rel) => {
                    if !self.inside_reasoning {
                        out.push_str(&fragment[idx..idx + rel]);
                    }
                    idx += rel + tag.len();
                    self.inside_reasoning = !self.inside_reasoning;
                }
                None => {
                    if !self.inside_reasoning {
                        out.push_str(&fragment[idx..]);
                    }
                    break;
                }
            }
        }
        out
    }
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHUNK_LEN)
    }
}
