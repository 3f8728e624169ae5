//! Rule definitions, merge, and evaluation.
//!
//! Evaluation is a pure function over extracted text: merge the company's
//! base pack with an optional program overlay, match every rule pattern
//! case-insensitively, bucket hits by rule kind, and fold the buckets into a
//! decision. The regex layer is a replaceable heuristic; the pipeline only
//! depends on the `Rule { pattern, kind, severity }` contract.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::model::{Decision, RuleHit, RuleSource, Severity};

/// Consequence class of a rule: a blocker forces `fail`, a condition forces
/// at most `conditional`, a finding is informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Finding,
    Condition,
    Blocker,
}

/// One pattern-based rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub title: String,
    /// When absent, a default is derived from `kind` at evaluation time.
    pub severity: Option<Severity>,
    /// Regex source; an empty or invalid pattern never matches and never
    /// aborts an evaluation.
    pub pattern: String,
    pub kind: RuleKind,
}

/// Company-level ordered rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePack {
    pub id: String,
    pub version: String,
    pub rules: Vec<Rule>,
}

/// Program-specific supplementary rules layered on top of a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overlay {
    pub id: String,
    pub name: String,
    pub rules: Vec<Rule>,
}

/// Maps a company to its rule pack. A profile without a pack id is a
/// terminal, fail-closed condition for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub id: String,
    pub rule_pack_id: Option<String>,
}

/// Loan program; may point at the overlay currently in effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: String,
    pub active_overlay_id: Option<String>,
}

/// Hit buckets produced by one evaluation run.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub findings: Vec<RuleHit>,
    pub conditions: Vec<RuleHit>,
    pub blockers: Vec<RuleHit>,
    /// Rules whose pattern failed to compile and were skipped.
    pub skipped_invalid: usize,
}

impl Evaluation {
    pub fn matched_count(&self) -> usize {
        self.findings.len() + self.conditions.len() + self.blockers.len()
    }
}

/// Concatenate base-pack rules with overlay rules, preserving pack order then
/// overlay order. No de-duplication by id: a rule id present in both sets
/// fires independently if both patterns match.
pub fn merge_rules<'a>(
    pack: &'a RulePack,
    overlay: Option<&'a Overlay>,
) -> Vec<(&'a Rule, RuleSource)> {
    let mut merged: Vec<(&Rule, RuleSource)> = pack
        .rules
        .iter()
        .map(|rule| (rule, RuleSource::Base))
        .collect();
    if let Some(overlay) = overlay {
        merged.extend(overlay.rules.iter().map(|rule| (rule, RuleSource::Overlay)));
    }
    merged
}

/// Match every rule against the full extracted text.
///
/// Patterns compile case-insensitively. Evidence is the first matched
/// substring, clipped to `evidence_clip_chars`.
pub fn evaluate(
    rules: &[(&Rule, RuleSource)],
    text: &str,
    evidence_clip_chars: usize,
) -> Evaluation {
    let mut result = Evaluation::default();

    for (rule, source) in rules {
        if rule.pattern.is_empty() {
            continue;
        }
        let regex = match RegexBuilder::new(&rule.pattern)
            .case_insensitive(true)
            .build()
        {
            Ok(regex) => regex,
            Err(e) => {
                tracing::debug!(rule_id = %rule.id, error = %e, "Skipping invalid rule pattern");
                result.skipped_invalid += 1;
                continue;
            }
        };
        let Some(matched) = regex.find(text) else {
            continue;
        };

        let hit = RuleHit {
            rule_id: rule.id.clone(),
            title: rule.title.clone(),
            severity: rule.severity.unwrap_or(default_severity(rule.kind)),
            evidence: clip_chars(matched.as_str(), evidence_clip_chars),
            source: *source,
        };
        match rule.kind {
            RuleKind::Finding => result.findings.push(hit),
            RuleKind::Condition => result.conditions.push(hit),
            RuleKind::Blocker => result.blockers.push(hit),
        }
    }

    result
}

/// Fold hit buckets into a decision. A single blocker overrides any number
/// of non-blocking hits.
pub fn decide(evaluation: &Evaluation) -> Decision {
    if !evaluation.blockers.is_empty() {
        Decision::Fail
    } else if !evaluation.conditions.is_empty() {
        Decision::Conditional
    } else {
        Decision::Pass
    }
}

fn default_severity(kind: RuleKind) -> Severity {
    match kind {
        RuleKind::Finding => Severity::Info,
        RuleKind::Condition => Severity::Warn,
        RuleKind::Blocker => Severity::Error,
    }
}

fn clip_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
