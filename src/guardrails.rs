//! Pre-retrieval query policy.
//!
//! A [`GuardrailPolicy`] is an ordered chain of [`QueryClassifier`]s. The first
//! classifier that matches decides the verdict; a query nothing matches is
//! [`Verdict::Allowed`]. Phrase lists come from configuration, so the chain is
//! data rather than code.

use serde::{Deserialize, Serialize};

/// Blocking categories, declared in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailCategory {
    OutOfScope,
    Unsafe,
    PersonalAdvice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    OutOfScope,
    Unsafe,
    PersonalAdvice,
    Allowed,
}

impl From<GuardrailCategory> for Verdict {
    fn from(category: GuardrailCategory) -> Self {
        match category {
            GuardrailCategory::OutOfScope => Verdict::OutOfScope,
            GuardrailCategory::Unsafe => Verdict::Unsafe,
            GuardrailCategory::PersonalAdvice => Verdict::PersonalAdvice,
        }
    }
}

/// A named set of trigger phrases, as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailRuleSet {
    pub name: String,
    pub category: GuardrailCategory,
    pub phrases: Vec<String>,
}

pub trait QueryClassifier: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> GuardrailCategory;
    /// `query` is already lower-cased.
    fn matches(&self, query: &str) -> bool;
}

/// Case-insensitive substring match against a phrase list.
pub struct PhraseClassifier {
    name: String,
    category: GuardrailCategory,
    phrases: Vec<String>,
}

impl PhraseClassifier {
    pub fn new(rule_set: &GuardrailRuleSet) -> Self {
        Self {
            name: rule_set.name.clone(),
            category: rule_set.category,
            phrases: normalize_phrases(&rule_set.phrases),
        }
    }
}

impl QueryClassifier for PhraseClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> GuardrailCategory {
        self.category
    }

    fn matches(&self, query: &str) -> bool {
        self.phrases.iter().any(|phrase| query.contains(phrase.as_str()))
    }
}

pub struct GuardrailPolicy {
    chain: Vec<Box<dyn QueryClassifier>>,
}

impl GuardrailPolicy {
    /// Builds the chain from configured rule sets. Rule sets are ordered by
    /// category precedence; configuration order is kept within a category.
    pub fn from_rule_sets(rule_sets: &[GuardrailRuleSet]) -> Self {
        let classifiers = rule_sets
            .iter()
            .map(|set| Box::new(PhraseClassifier::new(set)) as Box<dyn QueryClassifier>)
            .collect();
        Self::with_classifiers(classifiers)
    }

    pub fn with_classifiers(mut chain: Vec<Box<dyn QueryClassifier>>) -> Self {
        // sort_by_key is stable
        chain.sort_by_key(|classifier| classifier.category());
        Self { chain }
    }

    pub fn classify(&self, query: &str) -> Verdict {
        let normalized = query.to_lowercase();
        for classifier in &self.chain {
            if classifier.matches(&normalized) {
                tracing::debug!(rule = classifier.name(), "guardrail rule matched");
                return classifier.category().into();
            }
        }
        Verdict::Allowed
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Cards,
    Deposits,
    Mortgages,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRule {
    pub category: ProductCategory,
    pub keywords: Vec<String>,
}

/// Best-effort product tag. Never blocks a query.
pub struct ProductClassifier {
    rules: Vec<ProductRule>,
}

impl ProductClassifier {
    pub fn new(rules: &[ProductRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| ProductRule {
                category: rule.category,
                keywords: normalize_phrases(&rule.keywords),
            })
            .collect();
        Self { rules }
    }

    pub fn tag(&self, query: &str) -> ProductCategory {
        let normalized = query.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| normalized.contains(k.as_str())))
            .map(|rule| rule.category)
            .unwrap_or(ProductCategory::Unknown)
    }
}

fn normalize_phrases(phrases: &[String]) -> Vec<String> {
    phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

pub fn default_rule_sets() -> Vec<GuardrailRuleSet> {
    vec![
        GuardrailRuleSet {
            name: "out_of_scope".to_string(),
            category: GuardrailCategory::OutOfScope,
            phrases: owned(&[
                "bitcoin",
                "crypto",
                "cryptocurrency",
                "joke",
                "ανέκδοτο",
                "iphone",
                "samsung",
                "τεχνολογία",
                "πολιτική",
                "κυβέρνηση",
                "επένδυση",
                "επενδύσω",
                "μετοχές",
                "stock",
                "forex",
                "trading",
            ]),
        },
        GuardrailRuleSet {
            name: "unsafe".to_string(),
            category: GuardrailCategory::Unsafe,
            phrases: owned(&[
                "pin μου",
                "κωδικός μου",
                "password",
                "πώς να κλέψω",
                "hack",
                "χακάρω",
            ]),
        },
        GuardrailRuleSet {
            name: "personal_advice".to_string(),
            category: GuardrailCategory::PersonalAdvice,
            phrases: owned(&[
                "να πάρω",
                "να επιλέξω",
                "τι με συμφέρει",
                "συμβουλή",
                "επενδυτική συμβουλή",
                "προτείνεις",
            ]),
        },
    ]
}

pub fn default_product_rules() -> Vec<ProductRule> {
    vec![
        ProductRule {
            category: ProductCategory::Cards,
            keywords: owned(&["κάρτα", "card", "visa", "mastercard", "πιστωτ"]),
        },
        ProductRule {
            category: ProductCategory::Deposits,
            keywords: owned(&["κατάθεση", "deposit", "λογαριασμό"]),
        },
        ProductRule {
            category: ProductCategory::Mortgages,
            keywords: owned(&["στεγαστικό", "mortgage", "δάνειο"]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GuardrailPolicy {
        GuardrailPolicy::from_rule_sets(&default_rule_sets())
    }

    #[test]
    fn allows_plain_product_question() {
        assert_eq!(
            policy().classify("Ποιο είναι το πιστωτικό όριο της κάρτας;"),
            Verdict::Allowed
        );
    }

    #[test]
    fn each_category_is_detected() {
        let policy = policy();
        assert_eq!(policy.classify("τι crypto να αγοράσω;"), Verdict::OutOfScope);
        assert_eq!(
            policy.classify("ξέχασα το pin μου, πώς να το βρω;"),
            Verdict::Unsafe
        );
        assert_eq!(
            policy.classify("ποια κάρτα να επιλέξω;"),
            Verdict::PersonalAdvice
        );
    }

    #[test]
    fn out_of_scope_wins_over_unsafe() {
        assert_eq!(
            policy().classify("hack my bitcoin wallet"),
            Verdict::OutOfScope
        );
    }

    #[test]
    fn unsafe_wins_over_personal_advice() {
        assert_eq!(
            policy().classify("συμβουλή για το password μου"),
            Verdict::Unsafe
        );
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(policy().classify("Is BITCOIN a deposit?"), Verdict::OutOfScope);
        assert_eq!(policy().classify("ΞΕΧΑΣΑ ΤΟ PIN ΜΟΥ"), Verdict::Unsafe);
    }

    #[test]
    fn precedence_survives_reordered_configuration() {
        let mut sets = default_rule_sets();
        sets.reverse();
        let policy = GuardrailPolicy::from_rule_sets(&sets);
        assert_eq!(policy.classify("hack my bitcoin wallet"), Verdict::OutOfScope);
    }

    #[test]
    fn empty_phrases_never_match_everything() {
        let policy = GuardrailPolicy::from_rule_sets(&[GuardrailRuleSet {
            name: "blank".to_string(),
            category: GuardrailCategory::Unsafe,
            phrases: vec!["".to_string(), "   ".to_string()],
        }]);
        assert_eq!(policy.classify("anything at all"), Verdict::Allowed);
    }

    #[test]
    fn custom_classifier_joins_the_chain() {
        struct LongQuery;
        impl QueryClassifier for LongQuery {
            fn name(&self) -> &str {
                "long_query"
            }
            fn category(&self) -> GuardrailCategory {
                GuardrailCategory::PersonalAdvice
            }
            fn matches(&self, query: &str) -> bool {
                query.chars().count() > 20
            }
        }
        let policy = GuardrailPolicy::with_classifiers(vec![Box::new(LongQuery)]);
        assert_eq!(policy.len(), 1);
        assert_eq!(policy.classify("short"), Verdict::Allowed);
        assert_eq!(
            policy.classify("a considerably longer question"),
            Verdict::PersonalAdvice
        );
    }

    #[test]
    fn product_tagging() {
        let products = ProductClassifier::new(&default_product_rules());
        assert_eq!(products.tag("Όριο πιστωτικής κάρτας"), ProductCategory::Cards);
        assert_eq!(products.tag("επιτόκιο στην κατάθεση"), ProductCategory::Deposits);
        assert_eq!(products.tag("στεγαστικό δάνειο"), ProductCategory::Mortgages);
        assert_eq!(products.tag("ωράριο καταστημάτων"), ProductCategory::Unknown);
    }
}
