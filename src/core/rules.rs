// SerialCollect - core/rules.rs
//
// Rule engine: an ordered list of condition -> action rules applied to every
// parsed line. Conditions use a small keyword grammar:
//
//   value > 100                  comparison (> < >= <= == !=)
//   line contains 'ERR'
//   regex matches /^SYS:/i
//   field exists humidity
//   status equals 'ok'
//   line startsWith 'D:'         / line endsWith ';'
//   valid is true                / valid is false
//
// Condition strings are compiled once when a rule is added or changed.
// Evaluation never fails: an unrecognised or invalid condition is logged
// and treated as not matching.

use crate::core::model::{
    parse_number, Decision, FieldValue, ParsedData, RuleAction, RuleConfig, RuleResult,
};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Comparison operators of the `<field> <op> <value>` grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            ">" => Some(CompareOp::Gt),
            "<" => Some(CompareOp::Lt),
            ">=" => Some(CompareOp::Ge),
            "<=" => Some(CompareOp::Le),
            "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            _ => None,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
        }
    }
}

/// A compiled rule condition.
#[derive(Debug, Clone)]
pub enum Condition {
    Comparison {
        field: String,
        op: CompareOp,
        /// Right-hand side with surrounding quotes removed.
        text: String,
        number: Option<f64>,
    },
    Contains(String),
    RegexMatch(Regex),
    FieldExists(String),
    Equals { field: String, literal: String },
    StartsWith(String),
    EndsWith(String),
    BoolCheck { field: String, expected: bool },
    /// Syntactically unrecognised, or a `regex matches` pattern that does
    /// not compile. Never matches.
    Invalid { reason: String },
}

struct Grammar {
    comparison: Regex,
    contains: Regex,
    regex_match: Regex,
    exists: Regex,
    equals: Regex,
    starts_with: Regex,
    ends_with: Regex,
    bool_check: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        // Patterns are covered by the unit tests below.
        fn re(pat: &str) -> Regex {
            Regex::new(pat).expect("rule grammar: invalid regex")
        }
        Grammar {
            // Two-character operators are listed first so `>=` is never read
            // as `>` followed by `=...`.
            comparison: re(r"^(\w+)\s*(>=|<=|==|!=|>|<)\s*(.+)$"),
            contains: re(r#"(?i)^line\s+contains\s+['"](.+)['"]$"#),
            regex_match: re(r"(?i)^regex\s+matches\s+/(.+)/([gimsuy]*)$"),
            exists: re(r"(?i)^field\s+exists\s+(\w+)$"),
            equals: re(r#"(?i)^(\w+)\s+equals\s+['"](.+)['"]$"#),
            starts_with: re(r#"(?i)^line\s+startswith\s+['"](.+)['"]$"#),
            ends_with: re(r#"(?i)^line\s+endswith\s+['"](.+)['"]$"#),
            bool_check: re(r"(?i)^(\w+)\s+is\s+(true|false)$"),
        }
    })
}

const INVALID_FORMAT: &str =
    r#"Invalid condition format. Examples: "value > 100", "line contains 'ERR'""#;

fn strip_quotes(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')));
    if quoted {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn compile_js_regex(pattern: &str, flags: &str) -> Result<Regex, regex::Error> {
    let flags = flags.to_ascii_lowercase();
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
}

impl Condition {
    /// Compile a condition string. Grammars are tried in a fixed order and
    /// the first that matches wins.
    pub fn parse(condition: &str) -> Condition {
        let c = condition.trim();
        let g = grammar();

        if let Some(caps) = g.comparison.captures(c) {
            if let Some(op) = CompareOp::from_symbol(&caps[2]) {
                let text = strip_quotes(caps[3].trim()).to_string();
                let number = parse_number(&text);
                return Condition::Comparison {
                    field: caps[1].to_string(),
                    op,
                    text,
                    number,
                };
            }
        }
        if let Some(caps) = g.contains.captures(c) {
            return Condition::Contains(caps[1].to_string());
        }
        if let Some(caps) = g.regex_match.captures(c) {
            return match compile_js_regex(&caps[1], &caps[2]) {
                Ok(regex) => Condition::RegexMatch(regex),
                Err(e) => Condition::Invalid {
                    reason: format!("Invalid regex '{}': {e}", &caps[1]),
                },
            };
        }
        if let Some(caps) = g.exists.captures(c) {
            return Condition::FieldExists(caps[1].to_string());
        }
        if let Some(caps) = g.equals.captures(c) {
            return Condition::Equals {
                field: caps[1].to_string(),
                literal: caps[2].to_string(),
            };
        }
        if let Some(caps) = g.starts_with.captures(c) {
            return Condition::StartsWith(caps[1].to_string());
        }
        if let Some(caps) = g.ends_with.captures(c) {
            return Condition::EndsWith(caps[1].to_string());
        }
        if let Some(caps) = g.bool_check.captures(c) {
            return Condition::BoolCheck {
                field: caps[1].to_string(),
                expected: caps[2].eq_ignore_ascii_case("true"),
            };
        }
        Condition::Invalid {
            reason: INVALID_FORMAT.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Condition::Invalid { .. })
    }

    /// Test the condition against a parsed line.
    pub fn matches(&self, data: &ParsedData) -> bool {
        match self {
            Condition::Comparison {
                field,
                op,
                text,
                number,
            } => {
                let Some(value) = data.fields.get(field) else {
                    return false;
                };
                compare(value, *op, text, *number)
            }
            Condition::Contains(needle) => data.raw.contains(needle.as_str()),
            Condition::RegexMatch(regex) => regex.is_match(&data.raw),
            Condition::FieldExists(field) => data.fields.contains_key(field),
            Condition::Equals { field, literal } => data
                .fields
                .get(field)
                .is_some_and(|v| v.to_string() == *literal),
            Condition::StartsWith(prefix) => data.raw.starts_with(prefix.as_str()),
            Condition::EndsWith(suffix) => data.raw.ends_with(suffix.as_str()),
            Condition::BoolCheck { field, expected } => {
                data.fields.get(field).and_then(FieldValue::as_bool) == Some(*expected)
            }
            Condition::Invalid { .. } => false,
        }
    }
}

/// Numeric comparison when both sides are numbers, else string comparison.
fn compare(value: &FieldValue, op: CompareOp, text: &str, number: Option<f64>) -> bool {
    if let (Some(lhs), Some(rhs)) = (value.as_f64(), number) {
        return match lhs.partial_cmp(&rhs) {
            Some(ordering) => op.holds(ordering),
            None => op == CompareOp::Ne,
        };
    }
    op.holds(value.to_string().as_str().cmp(text))
}

/// Check a condition string without evaluating it.
pub fn validate_rule(condition: &str) -> Result<(), String> {
    match Condition::parse(condition) {
        Condition::Invalid { reason } => Err(reason),
        _ => Ok(()),
    }
}

/// Partial update applied by [`RulesEngine::update_rule`].
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub condition: Option<String>,
    pub action: Option<RuleAction>,
    /// `Some(None)` clears the value.
    pub value: Option<Option<String>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    config: RuleConfig,
    condition: Condition,
}

impl CompiledRule {
    fn new(config: RuleConfig) -> Self {
        let condition = Condition::parse(&config.condition);
        if let Condition::Invalid { reason } = &condition {
            tracing::warn!(
                rule_id = %config.id,
                condition = %config.condition,
                reason = %reason,
                "Rule condition is not valid and will never match"
            );
        }
        Self { config, condition }
    }
}

/// Ordered rule list. The first enabled rule whose condition matches wins.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    pub fn new(rules: &[RuleConfig]) -> Self {
        let mut engine = Self::default();
        engine.configure(rules);
        engine
    }

    /// Replace the whole rule list.
    pub fn configure(&mut self, rules: &[RuleConfig]) {
        self.rules = rules.iter().cloned().map(CompiledRule::new).collect();
        tracing::info!(
            rules = self.rules.len(),
            active = self.active_rules().len(),
            "Rules engine updated"
        );
    }

    pub fn add_rule(&mut self, rule: RuleConfig) {
        tracing::info!(rule_id = %rule.id, enabled = rule.enabled, "Rule added");
        self.rules.push(CompiledRule::new(rule));
    }

    /// Remove every rule with this id. Returns whether anything was removed.
    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.config.id != rule_id);
        let removed = self.rules.len() != before;
        if removed {
            tracing::info!(rule_id, "Rule removed");
        }
        removed
    }

    /// Apply a partial update to the first rule with this id.
    /// Returns false when no such rule exists.
    pub fn update_rule(&mut self, rule_id: &str, update: RuleUpdate) -> bool {
        let Some(rule) = self.rules.iter_mut().find(|r| r.config.id == rule_id) else {
            return false;
        };
        let mut config = rule.config.clone();
        if let Some(condition) = update.condition {
            config.condition = condition;
        }
        if let Some(action) = update.action {
            config.action = action;
        }
        if let Some(value) = update.value {
            config.value = value;
        }
        if let Some(enabled) = update.enabled {
            config.enabled = enabled;
        }
        *rule = CompiledRule::new(config);
        tracing::info!(rule_id, "Rule updated");
        true
    }

    /// All rules in evaluation order, enabled or not.
    pub fn rules(&self) -> Vec<RuleConfig> {
        self.rules.iter().map(|r| r.config.clone()).collect()
    }

    pub fn active_rules(&self) -> Vec<RuleConfig> {
        self.rules
            .iter()
            .filter(|r| r.config.enabled)
            .map(|r| r.config.clone())
            .collect()
    }

    /// Evaluate the rules against a parsed line.
    pub fn evaluate(&self, data: &ParsedData) -> RuleResult {
        for rule in self.rules.iter().filter(|r| r.config.enabled) {
            if let Condition::Invalid { reason } = &rule.condition {
                tracing::warn!(
                    rule_id = %rule.config.id,
                    condition = %rule.config.condition,
                    reason = %reason,
                    "Unknown condition format"
                );
                continue;
            }
            if rule.condition.matches(data) {
                tracing::debug!(
                    rule_id = %rule.config.id,
                    condition = %rule.config.condition,
                    "Rule matched"
                );
                return RuleResult {
                    action: Decision::from(rule.config.action),
                    value: rule.config.value.clone(),
                    rule_id: Some(rule.config.id.clone()),
                };
            }
        }
        RuleResult::pass()
    }
}
