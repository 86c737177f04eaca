//! Query orchestration: guardrail, retrieval, confidence gate, context
//! assembly, answer generation.

use std::sync::Arc;

use serde::Serialize;

use crate::config::Settings;
use crate::context;
use crate::document::Source;
use crate::embeddings::{self, Embedder};
use crate::error::{RagError, Result};
use crate::gate::{ConfidenceGate, GateDecision};
use crate::generator::{self, AnswerGenerator, OpenAiGenerator};
use crate::guardrails::{GuardrailPolicy, ProductCategory, ProductClassifier, Verdict};
use crate::index::{IndexHandle, IndexSnapshot};
use crate::search::{RetrievalEngine, RetrievalResult};

pub const OUT_OF_SCOPE_MESSAGE: &str = "Μπορώ να απαντήσω μόνο σε ερωτήσεις για τις πιστωτικές κάρτες, \
τις καταθέσεις και τα στεγαστικά δάνεια της τράπεζας.";
pub const UNSAFE_MESSAGE: &str = "Για λόγους ασφαλείας δεν μπορώ να βοηθήσω με κωδικούς, PIN ή άλλα \
ευαίσθητα στοιχεία. Επικοινωνήστε με την τράπεζα μέσω των επίσημων καναλιών της.";
pub const PERSONAL_ADVICE_MESSAGE: &str = "Δεν μπορώ να δώσω προσωπικές ή επενδυτικές συμβουλές. \
Μπορώ να περιγράψω τα χαρακτηριστικά των προϊόντων· για εξατομικευμένη συμβουλή απευθυνθείτε \
σε εκπρόσωπο της τράπεζας.";
pub const EMPTY_RETRIEVAL_MESSAGE: &str =
    "Δεν μπορώ να απαντήσω αξιόπιστα με βάση τα διαθέσιμα έγγραφα.";
pub const LOW_CONFIDENCE_MESSAGE: &str = "Δεν μπορώ να απαντήσω με σιγουριά στην ερώτηση, \
με βάση τα έγγραφα που έχουν ενσωματωθεί στο σύστημα.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    OutOfScope,
    Unsafe,
    PersonalAdvice,
    EmptyRetrieval,
    LowConfidence,
}

impl RefusalReason {
    pub fn message(&self) -> &'static str {
        match self {
            RefusalReason::OutOfScope => OUT_OF_SCOPE_MESSAGE,
            RefusalReason::Unsafe => UNSAFE_MESSAGE,
            RefusalReason::PersonalAdvice => PERSONAL_ADVICE_MESSAGE,
            RefusalReason::EmptyRetrieval => EMPTY_RETRIEVAL_MESSAGE,
            RefusalReason::LowConfidence => LOW_CONFIDENCE_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Answered,
    Refused(RefusalReason),
}

/// What the caller gets back. `outcome` stays internal.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    #[serde(skip)]
    pub outcome: Outcome,
}

impl Answer {
    pub fn refusal(reason: RefusalReason) -> Self {
        Self {
            answer: reason.message().to_string(),
            sources: Vec::new(),
            outcome: Outcome::Refused(reason),
        }
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self.outcome, Outcome::Refused(_))
    }
}

pub struct RagPipeline {
    guardrails: GuardrailPolicy,
    products: ProductClassifier,
    retriever: RetrievalEngine,
    gate: ConfidenceGate,
    generator: Arc<dyn AnswerGenerator>,
    top_k: usize,
    snippet_chars: usize,
}

impl RagPipeline {
    pub fn new(
        settings: &Settings,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn AnswerGenerator>,
        index: IndexHandle,
    ) -> Self {
        Self {
            guardrails: GuardrailPolicy::from_rule_sets(&settings.guardrails),
            products: ProductClassifier::new(&settings.products),
            retriever: RetrievalEngine::new(embedder, index),
            gate: ConfidenceGate::new(settings.confidence_threshold),
            generator,
            top_k: settings.top_k,
            snippet_chars: settings.snippet_chars,
        }
    }

    /// Wires the configured OpenAI-compatible providers and a lazily loaded
    /// index from `settings.index_dir`.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let embedder = embeddings::from_settings(settings)?;
        let generator: Arc<dyn AnswerGenerator> = Arc::new(OpenAiGenerator::from_settings(settings)?);
        let index = IndexHandle::open_lazily(&settings.index_dir, embedder.model_name());
        Ok(Self::new(settings, embedder, generator, index))
    }

    /// Forces the index load.
    pub fn warm_up(&self) -> Result<Arc<IndexSnapshot>> {
        self.retriever.snapshot()
    }

    pub fn classify(&self, query: &str) -> (Verdict, ProductCategory) {
        (self.guardrails.classify(query), self.products.tag(query))
    }

    pub fn retrieve(&self, query: &str) -> Result<RetrievalResult> {
        self.retriever.retrieve(query, self.top_k)
    }

    pub fn answer(&self, query: &str) -> Result<Answer> {
        if query.trim().is_empty() {
            return Err(RagError::EmptyQuery);
        }

        let (verdict, product) = self.classify(query);
        tracing::info!(?verdict, ?product, "query classified");
        match verdict {
            Verdict::OutOfScope => return Ok(Answer::refusal(RefusalReason::OutOfScope)),
            Verdict::Unsafe => return Ok(Answer::refusal(RefusalReason::Unsafe)),
            Verdict::PersonalAdvice => return Ok(Answer::refusal(RefusalReason::PersonalAdvice)),
            Verdict::Allowed => {}
        }

        let retrieved = self.retrieve(query)?;
        match self.gate.decide(&retrieved) {
            GateDecision::RefuseEmpty => {
                tracing::info!("no chunks retrieved, refusing");
                return Ok(Answer::refusal(RefusalReason::EmptyRetrieval));
            }
            GateDecision::RefuseLowConfidence => {
                tracing::info!(
                    threshold = self.gate.threshold(),
                    "closest chunk above threshold, refusing"
                );
                return Ok(Answer::refusal(RefusalReason::LowConfidence));
            }
            GateDecision::Proceed => {}
        }

        let context = context::assemble(&retrieved);
        tracing::debug!(
            context = %context.chars().take(1500).collect::<String>(),
            "context assembled"
        );

        tracing::info!(chunks = retrieved.len(), "calling answer generator");
        let answer = self
            .generator
            .generate(generator::SYSTEM_PROMPT, &generator::user_message(&context, query))
            .map_err(RagError::Generation)?;
        tracing::debug!(%answer, "answer generated");

        Ok(Answer {
            answer,
            sources: context::sources(&retrieved, self.snippet_chars),
            outcome: Outcome::Answered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_refusal_has_its_own_message() {
        let reasons = [
            RefusalReason::OutOfScope,
            RefusalReason::Unsafe,
            RefusalReason::PersonalAdvice,
            RefusalReason::EmptyRetrieval,
            RefusalReason::LowConfidence,
        ];
        for (i, a) in reasons.iter().enumerate() {
            for b in &reasons[i + 1..] {
                assert_ne!(a.message(), b.message());
            }
        }
    }

    #[test]
    fn refusal_serializes_without_outcome() {
        let json = serde_json::to_value(Answer::refusal(RefusalReason::Unsafe)).unwrap();
        assert_eq!(json["answer"], UNSAFE_MESSAGE);
        assert_eq!(json["sources"], serde_json::json!([]));
        assert!(json.get("outcome").is_none());
    }
}
