use basket_core::types::SearchHit;

pub const CHARS_PER_TOKEN: usize = 4;
/// Smallest fragment worth appending as a truncated trailing block.
pub const MIN_FRAGMENT_TOKENS: usize = 25;
pub const TRUNCATION_MARKER: &str = "\n[...truncated]";
const SEPARATOR: &str = "\n\n";

/// Token estimate used throughout: characters / 4, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub tokens: usize,
    /// Blocks included, the truncated one counted.
    pub documents: usize,
    pub truncated: bool,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.documents == 0
    }
}

/// Packs labeled hit blocks into a token budget.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_tokens: usize,
}

impl ContextAssembler {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn block(position: usize, hit: &SearchHit) -> String {
        format!("Document {position} (similarity={:.3}): {}\n{}", hit.score, hit.document.name, hit.document.content)
    }

    pub fn assemble(&self, hits: &[SearchHit]) -> AssembledContext {
        let budget = self.max_tokens.saturating_mul(CHARS_PER_TOKEN);
        let mut text = String::new();
        let mut used = 0usize;
        let mut documents = 0usize;
        let mut truncated = false;

        for (i, hit) in hits.iter().enumerate() {
            let sep = if text.is_empty() { 0 } else { SEPARATOR.len() };
            let block = Self::block(i + 1, hit);
            let len = block.chars().count();
            if used + sep + len <= budget {
                if sep > 0 {
                    text.push_str(SEPARATOR);
                }
                text.push_str(&block);
                used += sep + len;
                documents += 1;
                if used == budget {
                    break;
                }
                continue;
            }

            let room = budget.saturating_sub(used + sep);
            if room / CHARS_PER_TOKEN > MIN_FRAGMENT_TOKENS {
                let keep = room - TRUNCATION_MARKER.len();
                if sep > 0 {
                    text.push_str(SEPARATOR);
                }
                text.extend(block.chars().take(keep));
                text.push_str(TRUNCATION_MARKER);
                documents += 1;
                truncated = true;
            }
            break;
        }

        let tokens = estimate_tokens(&text);
        tracing::debug!(documents, tokens, truncated, budget = self.max_tokens, "context assembled");
        AssembledContext { text, tokens, documents, truncated }
    }
}
