//! Risk Assessor (spec §4.7): a pure function `(operation, context) -> level`.
//!
//! No I/O. The rule table is data (`RiskRulesConfig`), so operators can
//! tune it without a code change; `RiskAssessor::default()` encodes the
//! four example trigger classes from the spec text directly so the system
//! is usable with no external configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Free-form description of the operation under assessment, plus the
/// structured facts the rule table matches against. `tags` is intentionally
/// open-ended (e.g. "production", "secrets", "deletion", "main_branch") so
/// new triggers can be added purely as configuration.
#[derive(Debug, Clone, Default)]
pub struct AssessmentContext {
    pub environment: Option<String>,
    pub tags: HashSet<String>,
    pub diff_lines: Option<u64>,
}

impl AssessmentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_diff_lines(mut self, lines: u64) -> Self {
        self.diff_lines = Some(lines);
        self
    }

    fn has_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.tags.contains(*n))
    }
}

/// One entry in the declarative rule table. `matches` is evaluated in
/// `RiskRule::applies`; the assessor keeps the most severe matching rule
/// (tie-break rule from the spec).
#[derive(Debug, Clone)]
pub struct RiskRule {
    pub level: RiskLevel,
    pub name: &'static str,
    pub requires_tags_any: Vec<&'static str>,
    pub requires_environment: Option<&'static str>,
    pub min_diff_lines: Option<u64>,
}

impl RiskRule {
    fn applies(&self, ctx: &AssessmentContext) -> bool {
        let tag_ok = self.requires_tags_any.is_empty() || ctx.has_any(&self.requires_tags_any);
        let env_ok = match self.requires_environment {
            Some(env) => ctx.environment.as_deref() == Some(env),
            None => true,
        };
        let diff_ok = match self.min_diff_lines {
            Some(min) => ctx.diff_lines.unwrap_or(0) >= min,
            None => true,
        };
        // A rule with no conditions at all never silently matches everything;
        // it must specify at least one of tags/environment/diff threshold.
        let has_condition = !self.requires_tags_any.is_empty()
            || self.requires_environment.is_some()
            || self.min_diff_lines.is_some();
        has_condition && tag_ok && env_ok && diff_ok
    }
}

#[derive(Debug, Clone)]
pub struct RiskRulesConfig {
    pub rules: Vec<RiskRule>,
}

impl Default for RiskRulesConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                RiskRule {
                    level: RiskLevel::Critical,
                    name: "deletion_in_production",
                    requires_tags_any: vec!["deletion"],
                    requires_environment: Some("production"),
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::Critical,
                    name: "secret_modification",
                    requires_tags_any: vec!["secrets"],
                    requires_environment: None,
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::Critical,
                    name: "sensitive_data_export",
                    requires_tags_any: vec!["sensitive_export"],
                    requires_environment: None,
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::High,
                    name: "production_deployment",
                    requires_tags_any: vec!["deployment"],
                    requires_environment: Some("production"),
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::High,
                    name: "infrastructure_mutation",
                    requires_tags_any: vec!["infrastructure"],
                    requires_environment: None,
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::High,
                    name: "main_branch_merge_substantial_diff",
                    requires_tags_any: vec!["main_branch_merge"],
                    requires_environment: None,
                    min_diff_lines: Some(300),
                },
                RiskRule {
                    level: RiskLevel::Medium,
                    name: "staging_deployment",
                    requires_tags_any: vec!["deployment"],
                    requires_environment: Some("staging"),
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::Medium,
                    name: "nontrivial_change_outside_dev",
                    requires_tags_any: vec!["code_change"],
                    requires_environment: None,
                    min_diff_lines: Some(30),
                },
                RiskRule {
                    level: RiskLevel::Low,
                    name: "reads",
                    requires_tags_any: vec!["read"],
                    requires_environment: None,
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::Low,
                    name: "dev_environment_mutation",
                    requires_tags_any: vec![],
                    requires_environment: Some("development"),
                    min_diff_lines: None,
                },
                RiskRule {
                    level: RiskLevel::Low,
                    name: "documentation_change",
                    requires_tags_any: vec!["documentation"],
                    requires_environment: None,
                    min_diff_lines: None,
                },
            ],
        }
    }
}

pub struct RiskAssessor {
    rules: RiskRulesConfig,
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new(RiskRulesConfig::default())
    }
}

impl RiskAssessor {
    pub fn new(rules: RiskRulesConfig) -> Self {
        Self { rules }
    }

    /// Pure assessment: the most severe matching trigger wins. Falls back to
    /// `Low` when nothing matches (reads/dev-environment/docs are the common
    /// case and the spec treats unmatched operations as the safe default).
    pub fn assess(&self, ctx: &AssessmentContext) -> RiskLevel {
        self.rules
            .rules
            .iter()
            .filter(|r| r.applies(ctx))
            .map(|r| r.level)
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    /// Policy helper: default is `true` for `high`/`critical`, `false` otherwise.
    pub fn requires_approval(level: RiskLevel) -> bool {
        matches!(level, RiskLevel::High | RiskLevel::Critical)
    }
}
