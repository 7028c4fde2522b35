use crate::config::ChunkingConfig;
use crate::core::context::FileEntry;

/// Overlapping slices of one long text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunks {
    pub pieces: Vec<String>,
    /// Characters each piece after the first repeats from its predecessor.
    pub overlap: usize,
}

impl TextChunks {
    /// The original text, with the repeated overlap dropped.
    pub fn reassemble(&self) -> String {
        let mut out = String::new();
        for (i, piece) in self.pieces.iter().enumerate() {
            if i == 0 {
                out.push_str(piece);
            } else {
                out.extend(piece.chars().skip(self.overlap));
            }
        }
        out
    }
}

/// Splits analysis input into prompts that fit a context window.
///
/// Files are the unit of chunking and are never cut: they are packed in order
/// until the rendered prompt would pass `budget * safety_factor`. A file that
/// cannot fit a prompt of its own within `budget` is sent in a chunk by itself.
/// [`Chunker::chunk_text`] is the separate line-boundary splitter for one long
/// document. Output is deterministic.
#[derive(Debug, Clone)]
pub struct Chunker {
    safety_factor: f64,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            safety_factor: config.safety_factor.clamp(0.05, 1.0),
            overlap_chars: config.text_overlap_chars,
        }
    }

    /// Tokens a prompt may use out of `budget`, leaving the rest for the reply.
    pub fn threshold(&self, budget: usize) -> usize {
        (budget as f64 * self.safety_factor).floor() as usize
    }

    pub fn chunk<R, E>(&self, files: &[FileEntry], budget: usize, render: R, estimate: E) -> Vec<String>
    where
        R: Fn(&[FileEntry]) -> String,
        E: Fn(&str) -> usize,
    {
        let threshold = self.threshold(budget);
        let mut chunks = Vec::new();
        let mut current: Vec<FileEntry> = Vec::new();

        for file in files {
            current.push(file.clone());
            if estimate(&render(&current)) <= threshold {
                continue;
            }
            current.pop();

            if !current.is_empty() {
                chunks.push(render(&current));
                current.clear();
            }

            let alone = render(std::slice::from_ref(file));
            if estimate(&alone) <= budget {
                current.push(file.clone());
            } else {
                tracing::warn!(
                    "{} does not fit a {} token prompt on its own; sending it alone",
                    file.path,
                    budget
                );
                chunks.push(alone);
            }
        }

        if !current.is_empty() {
            chunks.push(render(&current));
        }
        chunks
    }

    /// Splits `text` into pieces of at most `budget_tokens * 4` characters,
    /// breaking after the last newline that keeps the piece past the overlap
    /// region, and repeating the configured overlap at the start of each
    /// following piece.
    pub fn chunk_text(&self, text: &str, budget_tokens: usize) -> TextChunks {
        let max_chars = budget_tokens.saturating_mul(4).max(1);
        let overlap = self.overlap_chars.min(max_chars / 2);
        let chars: Vec<char> = text.chars().collect();

        if chars.len() <= max_chars {
            return TextChunks {
                pieces: vec![text.to_string()],
                overlap,
            };
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        loop {
            let hard_end = (start + max_chars).min(chars.len());
            if hard_end == chars.len() {
                pieces.push(chars[start..].iter().collect());
                break;
            }

            let search_from = start + overlap + 1;
            let end = chars[search_from..hard_end]
                .iter()
                .rposition(|c| *c == '\n')
                .map(|pos| search_from + pos + 1)
                .unwrap_or(hard_end);

            pieces.push(chars[start..end].iter().collect());
            start = end - overlap;
        }

        TextChunks { pieces, overlap }
    }
}
