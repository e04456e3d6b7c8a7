//! crates/lesson_core/src/chunk.rs
//!
//! Splits arbitrary-length source text into bounded, sentence-aware chunks
//! for the chunked prompt runner. Chunking is a pure function of the input
//! text and the policy, so plans are reproducible.

/// Named per-task chunking constants, loaded from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Soft upper bound on words per chunk.
    pub target_words: usize,
    /// Trailing words of the previous chunk repeated at the start of the
    /// next one, for cross-chunk context continuity.
    pub overlap_words: usize,
    /// Hard cap on chunk count; text beyond it is dropped.
    pub max_chunks: usize,
    /// Wall-clock budget for processing the whole plan, if any.
    pub time_budget_ms: Option<u64>,
}

impl ChunkPolicy {
    pub fn new(target_words: usize, overlap_words: usize, max_chunks: usize) -> Self {
        Self { target_words, overlap_words, max_chunks, time_budget_ms: None }
    }

    pub fn with_time_budget_ms(mut self, budget_ms: u64) -> Self {
        self.time_budget_ms = Some(budget_ms);
        self
    }
}

/// An immutable plan: the ordered chunks plus bookkeeping totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunks: Vec<String>,
    pub total_words: usize,
    pub total_chars: usize,
    pub target_words: usize,
    pub overlap_words: usize,
}

impl ChunkPlan {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    fn empty(policy: &ChunkPolicy) -> Self {
        Self {
            chunks: Vec::new(),
            total_words: 0,
            total_chars: 0,
            target_words: policy.target_words,
            overlap_words: policy.overlap_words,
        }
    }
}

/// Builds a chunk plan for `text` under `policy`.
///
/// Sentence boundaries are `.`, `!`, `?` followed by whitespace, and
/// newlines. When no boundary is detected at all, falls back to a plain
/// word-window chunker with overlap. Emitting stops at `max_chunks`;
/// remaining text is dropped, an accepted tradeoff that bounds latency
/// and token cost per lesson.
pub fn plan(text: &str, policy: &ChunkPolicy) -> ChunkPlan {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return ChunkPlan::empty(policy);
    }

    let target = policy.target_words.max(1);
    let overlap = policy.overlap_words.min(target.saturating_sub(1));
    let max_chunks = policy.max_chunks.max(1);

    let total_words: usize = sentences.iter().map(|s| s.split(' ').count()).sum();
    let total_chars: usize = sentences.iter().map(|s| s.chars().count()).sum();

    let chunks = if sentences.len() == 1 {
        window_chunks(&sentences[0], target, overlap, max_chunks)
    } else {
        sentence_chunks(&sentences, target, overlap, max_chunks)
    };

    ChunkPlan {
        chunks,
        total_words,
        total_chars,
        target_words: policy.target_words,
        overlap_words: policy.overlap_words,
    }
}

/// Splits on sentence boundaries and normalizes whitespace per sentence.
/// Never returns empty entries.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if at_boundary {
                push_sentence(&mut sentences, &mut current);
            }
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let normalized = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        sentences.push(normalized);
    }
    current.clear();
}

/// Fallback for boundary-free text: fixed word windows advancing by
/// `target - overlap` words.
fn window_chunks(sentence: &str, target: usize, overlap: usize, max_chunks: usize) -> Vec<String> {
    let words: Vec<&str> = sentence.split(' ').collect();
    let step = (target - overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < words.len() && chunks.len() < max_chunks {
        let end = (start + target).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Accumulates whole sentences into chunks of at most ~`target` words,
/// seeding each new chunk with the previous chunk's overlap tail.
fn sentence_chunks(
    sentences: &[String],
    target: usize,
    overlap: usize,
    max_chunks: usize,
) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    // Words in the buffer that came from sentences rather than overlap
    // seeding; a chunk must contain at least one fresh sentence.
    let mut fresh_words = 0usize;

    for sentence in sentences {
        let words: Vec<String> = sentence.split(' ').map(str::to_string).collect();

        if fresh_words > 0 && buffer.len() + words.len() > target {
            chunks.push(buffer.join(" "));
            if chunks.len() >= max_chunks {
                return chunks;
            }
            let tail_start = buffer.len().saturating_sub(overlap);
            buffer = buffer.split_off(tail_start);
            fresh_words = 0;
        }

        fresh_words += words.len();
        buffer.extend(words);
    }

    if fresh_words > 0 && chunks.len() < max_chunks {
        chunks.push(buffer.join(" "));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(target: usize, overlap: usize, max: usize) -> ChunkPolicy {
        ChunkPolicy::new(target, overlap, max)
    }

    fn sample_text(sentences: usize, words_per_sentence: usize) -> String {
        (0..sentences)
            .map(|i| {
                let body = (0..words_per_sentence)
                    .map(|w| format!("w{}s{}", w, i))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{}.", body)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        let p = plan("   \n\t  ", &policy(50, 10, 4));
        assert!(p.is_empty());
        assert_eq!(p.total_words, 0);
        assert_eq!(p.total_chars, 0);
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let p = plan("One sentence here. And a second one.", &policy(50, 10, 4));
        assert_eq!(p.len(), 1);
        assert_eq!(p.chunks[0], "One sentence here. And a second one.");
    }

    #[test]
    fn whitespace_runs_are_collapsed() {
        let p = plan("Hello   world.\n\nNext\tline here.", &policy(50, 10, 4));
        assert_eq!(p.chunks, vec!["Hello world. Next line here.".to_string()]);
    }

    #[test]
    fn planning_is_deterministic() {
        let text = sample_text(30, 12);
        let pol = policy(40, 8, 6);
        assert_eq!(plan(&text, &pol), plan(&text, &pol));
    }

    #[test]
    fn chunk_count_never_exceeds_cap() {
        let text = sample_text(200, 15);
        let p = plan(&text, &policy(30, 5, 4));
        assert!(p.len() <= 4);
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn no_chunk_is_empty() {
        for text in [
            sample_text(50, 7),
            "word ".repeat(500),
            "Short. Tiny! What? Yes.".to_string(),
        ] {
            let p = plan(&text, &policy(20, 6, 8));
            assert!(!p.chunks.iter().any(|c| c.trim().is_empty()));
        }
    }

    #[test]
    fn adjacent_chunks_share_an_overlap_tail() {
        let text = sample_text(40, 10);
        let pol = policy(30, 6, 10);
        let p = plan(&text, &pol);
        assert!(p.len() > 1);

        for pair in p.chunks.windows(2) {
            let prev: Vec<&str> = pair[0].split(' ').collect();
            let next: Vec<&str> = pair[1].split(' ').collect();
            let tail: Vec<&str> = prev[prev.len() - pol.overlap_words..].to_vec();
            assert_eq!(&next[..pol.overlap_words], tail.as_slice());
        }
    }

    #[test]
    fn boundary_free_text_uses_word_windows() {
        let text = (0..100).map(|i| format!("tok{}", i)).collect::<Vec<_>>().join(" ");
        let p = plan(&text, &policy(20, 5, 10));
        assert!(p.len() > 1);
        // Windows advance by target - overlap words.
        assert!(p.chunks[0].starts_with("tok0"));
        assert!(p.chunks[1].starts_with("tok15"));
        assert_eq!(p.chunks[0].split(' ').count(), 20);
    }

    #[test]
    fn boundary_free_text_respects_cap() {
        let text = "tok ".repeat(10_000);
        let p = plan(&text, &policy(20, 5, 3));
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn totals_reflect_normalized_text() {
        let p = plan("One two three. Four five.", &policy(50, 10, 4));
        assert_eq!(p.total_words, 5);
    }
}
