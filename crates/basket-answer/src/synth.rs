//! Prompt construction, the completion call, and confidence scoring.

use std::sync::Arc;

use basket_core::config::RagConfig;
use basket_core::error::{Error, Result};
use basket_core::traits::Completer;
use basket_core::types::{AnswerStyle, CompletionRequest, SearchHit};

use crate::context::AssembledContext;

/// Phrases that mark an answer as unsure.
pub const HEDGING_PHRASES: &[&str] = &["i don't know", "i do not know", "not enough information"];
/// Phrases that mark an answer as grounded in the sources.
pub const ATTRIBUTION_PHRASES: &[&str] = &["based on", "according to"];

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You answer questions using only the documents provided. If they do not contain the answer, say so plainly.";

pub fn style_instruction(style: AnswerStyle) -> &'static str {
    match style {
        AnswerStyle::Concise => "Answer concisely in two or three sentences.",
        AnswerStyle::Detailed => "Answer in detail, explaining the relevant points from each document.",
        AnswerStyle::BulletPoints => "Answer as a short list of bullet points.",
    }
}

pub fn build_prompt(query: &str, context: &AssembledContext, style: AnswerStyle, include_citations: bool) -> String {
    let mut instructions = vec![style_instruction(style)];
    if include_citations {
        instructions.push("Refer to documents by their number, e.g. [Document 1].");
    }
    format!(
        "Use the following documents to answer the question.\n\n\
         ## Documents\n\n{}\n\n## Question\n\n{}\n\n## Instructions\n\n{}",
        context.text,
        query,
        instructions.join(" ")
    )
}

/// 0.3 for hedging, 1.2 for attribution, otherwise 1.0. Hedging wins when both appear.
pub fn quality_factor(answer: &str) -> f32 {
    let lower = answer.to_lowercase();
    if HEDGING_PHRASES.iter().any(|p| lower.contains(p)) {
        0.3
    } else if ATTRIBUTION_PHRASES.iter().any(|p| lower.contains(p)) {
        1.2
    } else {
        1.0
    }
}

/// `avg(score) * min(n / 3, 1) * quality_factor`, clamped to [0, 1].
pub fn confidence(sources: &[SearchHit], answer: &str) -> f32 {
    if sources.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = sources.len() as f32;
    let avg = sources.iter().map(|h| h.score).sum::<f32>() / n;
    let coverage = (n / 3.0).min(1.0);
    let score = avg * coverage * quality_factor(answer);
    if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 }
}

/// Numbered source list appended after the answer text.
pub fn citations(sources: &[SearchHit]) -> String {
    let lines: Vec<String> = sources
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{}. {} (similarity: {:.2})", i + 1, h.document.name, h.score))
        .collect();
    format!("Sources:\n{}", lines.join("\n"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: String,
    pub confidence: f32,
}

pub struct AnswerSynthesizer {
    completer: Arc<dyn Completer>,
    style: AnswerStyle,
    include_citations: bool,
    max_tokens: u32,
    temperature: f32,
    system_prompt: String,
}

impl AnswerSynthesizer {
    pub fn new(config: &RagConfig, completer: Arc<dyn Completer>) -> Self {
        Self {
            completer,
            style: config.answer_style,
            include_citations: config.include_citations,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone().unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn style(&self) -> AnswerStyle {
        self.style
    }

    pub async fn synthesize(
        &self,
        query: &str,
        context: &AssembledContext,
        sources: &[SearchHit],
    ) -> Result<Synthesis> {
        let request = CompletionRequest {
            prompt: build_prompt(query, context, self.style, self.include_citations),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system_prompt: Some(self.system_prompt.clone()),
        };
        let raw = self.completer.complete(&request).await.map_err(|e| Error::Synthesis(format!("{e:#}")))?;
        let text = raw.trim();
        if text.is_empty() {
            return Err(Error::Synthesis("completion was empty".into()));
        }
        let confidence = confidence(sources, text);
        let answer = if self.include_citations && !sources.is_empty() {
            format!("{text}\n\n{}", citations(sources))
        } else {
            text.to_string()
        };
        Ok(Synthesis { answer, confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_core::types::{BackendKind, DocumentRef, Meta};

    fn hit(score: f32) -> SearchHit {
        SearchHit {
            document: DocumentRef::new("d", "d.md", "b", "c"),
            score,
            rank: 0,
            source: BackendKind::Memory,
            provenance: Meta::new(),
        }
    }

    #[test]
    fn quality_factor_phrases() {
        assert!((quality_factor("I don't know.") - 0.3).abs() < f32::EPSILON);
        assert!((quality_factor("According to the manual, yes.") - 1.2).abs() < f32::EPSILON);
        assert!((quality_factor("Yes.") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn confidence_follows_the_formula() {
        let three = [hit(0.9), hit(0.8), hit(0.7)];
        assert!((confidence(&three, "Yes.") - 0.8).abs() < 1e-6);
        // fewer than three sources scale down
        assert!((confidence(&three[..1], "Yes.") - 0.3).abs() < 1e-6);
        // attribution boost is clamped
        assert!((confidence(&[hit(0.95), hit(0.95), hit(0.95)], "Based on the docs, yes.") - 1.0).abs() < 1e-6);
        assert_eq!(confidence(&[], "anything"), 0.0);
        assert_eq!(confidence(&[hit(-0.5)], "anything"), 0.0);
    }

    #[test]
    fn prompt_carries_style_and_citation_instructions() {
        let ctx = AssembledContext {
            text: "Document 1 (similarity=0.900): a\nalpha".into(),
            tokens: 10,
            documents: 1,
            truncated: false,
        };
        let p = build_prompt("What is alpha?", &ctx, AnswerStyle::BulletPoints, true);
        assert!(p.contains("What is alpha?"));
        assert!(p.contains("alpha"));
        assert!(p.contains("bullet points"));
        assert!(p.contains("[Document 1]"));
        assert!(!build_prompt("q", &ctx, AnswerStyle::Concise, false).contains("[Document 1]"));
    }

    #[test]
    fn citations_are_numbered() {
        let expected = "Sources:\n1. d.md (similarity: 0.91)\n2. d.md (similarity: 0.50)";
        assert_eq!(citations(&[hit(0.912), hit(0.5)]), expected);
    }
}
