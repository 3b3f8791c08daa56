/// Explicit classification rules
///
/// Rules run before pattern scoring in descending priority order. A rule that
/// fires with confidence at or above the short-circuit threshold decides the
/// classification outright; a weaker rule is kept and blended with the
/// pattern result.
use super::patterns::{MatchInput, Matcher};
use crate::taxonomy::{Category, Severity, Strategy};
use std::fmt;
use std::sync::Arc;

pub type RuleId = String;

/// Condition a rule fires on
#[derive(Clone)]
pub enum RulePredicate {
    Match(Matcher),
    All(Vec<RulePredicate>),
    Any(Vec<RulePredicate>),
    Not(Box<RulePredicate>),
    Custom(Arc<dyn Fn(&MatchInput<'_>) -> bool + Send + Sync>),
}

impl RulePredicate {
    pub fn message(needle: &str) -> Self {
        RulePredicate::Match(Matcher::message(needle))
    }

    pub fn frame(needle: &str) -> Self {
        RulePredicate::Match(Matcher::frame(needle))
    }

    pub fn any_message(needles: &[&str]) -> Self {
        RulePredicate::Any(needles.iter().map(|n| Self::message(n)).collect())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&MatchInput<'_>) -> bool + Send + Sync + 'static,
    {
        RulePredicate::Custom(Arc::new(f))
    }

    pub fn evaluate(&self, input: &MatchInput<'_>) -> bool {
        match self {
            RulePredicate::Match(matcher) => matcher.matches(input),
            RulePredicate::All(all) => all.iter().all(|p| p.evaluate(input)),
            RulePredicate::Any(any) => any.iter().any(|p| p.evaluate(input)),
            RulePredicate::Not(inner) => !inner.evaluate(input),
            RulePredicate::Custom(f) => f(input),
        }
    }
}

impl fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulePredicate::Match(m) => f.debug_tuple("Match").field(m).finish(),
            RulePredicate::All(all) => f.debug_tuple("All").field(all).finish(),
            RulePredicate::Any(any) => f.debug_tuple("Any").field(any).finish(),
            RulePredicate::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            RulePredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A prioritized predicate with a fixed classification
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub id: RuleId,
    pub priority: u32,
    pub predicate: RulePredicate,
    pub category: Category,
    pub severity: Severity,
    pub strategy: Strategy,
    /// 0..=100
    pub confidence: u8,
    pub retryable: bool,
}

impl ClassificationRule {
    pub fn new(
        id: &str,
        priority: u32,
        predicate: RulePredicate,
        category: Category,
        severity: Severity,
        strategy: Strategy,
        confidence: u8,
    ) -> Self {
        Self {
            id: id.to_string(),
            priority,
            predicate,
            category,
            severity,
            strategy,
            confidence: confidence.min(100),
            retryable: category.is_transient(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// A rule that fired
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub id: RuleId,
    pub category: Category,
    pub severity: Severity,
    pub strategy: Strategy,
    pub confidence: u8,
    pub retryable: bool,
}

impl From<&ClassificationRule> for RuleMatch {
    fn from(rule: &ClassificationRule) -> Self {
        Self {
            id: rule.id.clone(),
            category: rule.category,
            severity: rule.severity,
            strategy: rule.strategy,
            confidence: rule.confidence,
            retryable: rule.retryable,
        }
    }
}

/// Result of running the rule set once
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    /// Highest-priority rule that fired
    pub matched: Option<RuleMatch>,
    /// The matched rule decides the classification on its own
    pub short_circuit: bool,
    pub evaluated: usize,
}

/// Ordered, bounded rule set
#[derive(Debug, Clone)]
pub struct ClassificationRuleEngine {
    rules: Vec<ClassificationRule>,
    max_rules: usize,
    short_circuit_confidence: u8,
}

impl ClassificationRuleEngine {
    pub fn new(max_rules: usize, short_circuit_confidence: u8) -> Self {
        Self {
            rules: Vec::new(),
            max_rules,
            short_circuit_confidence,
        }
    }

    pub fn with_defaults(max_rules: usize, short_circuit_confidence: u8) -> Self {
        let mut engine = Self::new(max_rules, short_circuit_confidence);
        for rule in default_rules() {
            engine.add_rule(rule);
        }
        engine
    }

    /// Insert a rule keeping descending priority; equal priorities keep
    /// insertion order.
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        let position = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(position, rule);

        if self.rules.len() > self.max_rules {
            tracing::warn!(
                rules = self.rules.len(),
                max_rules = self.max_rules,
                "Rule count exceeds the evaluation cap, lowest-priority rules will be skipped"
            );
        }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, input: &MatchInput<'_>) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();

        for rule in self.rules.iter().take(self.max_rules) {
            outcome.evaluated += 1;
            if !rule.predicate.evaluate(input) {
                continue;
            }

            if rule.confidence >= self.short_circuit_confidence {
                outcome.matched = Some(RuleMatch::from(rule));
                outcome.short_circuit = true;
                return outcome;
            }

            if outcome.matched.is_none() {
                outcome.matched = Some(RuleMatch::from(rule));
            }
        }

        outcome
    }
}

/// Rules shipped with the engine
pub fn default_rules() -> Vec<ClassificationRule> {
    use Category::*;
    use Severity::*;
    use Strategy::*;

    vec![
        ClassificationRule::new(
            "save-quota-exceeded",
            100,
            RulePredicate::All(vec![
                RulePredicate::any_message(&["quotaexceeded", "quota exceeded", "exceeded the quota"]),
                RulePredicate::Any(vec![
                    RulePredicate::Match(Matcher::context_equals("operation", "save")),
                    RulePredicate::Match(Matcher::context_equals("subsystem", "save")),
                    RulePredicate::frame("save"),
                    RulePredicate::message("setitem"),
                ]),
            ]),
            Save,
            High,
            CheckpointRollback,
            95,
        ),
        ClassificationRule::new(
            "save-corruption",
            95,
            RulePredicate::Any(vec![
                RulePredicate::any_message(&["save data corrupt", "checksum mismatch", "corrupted save"]),
                RulePredicate::All(vec![
                    RulePredicate::message("unexpected token"),
                    RulePredicate::frame("load"),
                ]),
            ]),
            Save,
            Critical,
            CheckpointRollback,
            92,
        ),
        ClassificationRule::new(
            "stack-overflow",
            90,
            RulePredicate::any_message(&["maximum call stack size exceeded", "too much recursion"]),
            Core,
            Critical,
            RestartSubsystem,
            90,
        ),
        ClassificationRule::new(
            "out-of-memory",
            85,
            RulePredicate::any_message(&["out of memory", "allocation failed", "array buffer allocation failed"]),
            Memory,
            Critical,
            RestartSubsystem,
            90,
        ),
        ClassificationRule::new(
            "progression-invalid-number",
            80,
            RulePredicate::Any(vec![
                RulePredicate::Match(Matcher::ContextEquals {
                    key: "value_is_nan".to_string(),
                    value: serde_json::Value::Bool(true),
                }),
                RulePredicate::All(vec![
                    RulePredicate::custom(|input| {
                        input
                            .message
                            .split(|c: char| !c.is_alphanumeric())
                            .any(|word| word == "nan" || word == "infinity")
                    }),
                    RulePredicate::Any(vec![
                        RulePredicate::frame("cultivation"),
                        RulePredicate::frame("progress"),
                        RulePredicate::frame("realm"),
                    ]),
                ]),
            ]),
            Progression,
            High,
            CheckpointRollback,
            90,
        ),
        ClassificationRule::new(
            "network-offline",
            70,
            RulePredicate::any_message(&["failed to fetch", "networkerror", "net::err_", "load failed"]),
            Network,
            Low,
            RetryWithBackoff,
            85,
        )
        .retryable(true),
        ClassificationRule::new(
            "resize-observer-loop",
            60,
            RulePredicate::message("resizeobserver loop"),
            Ui,
            Info,
            Ignore,
            95,
        ),
        ClassificationRule::new(
            "opaque-script-error",
            50,
            RulePredicate::custom(|input| input.message.trim() == "script error."),
            Unknown,
            Low,
            Ignore,
            70,
        ),
    ]
}
